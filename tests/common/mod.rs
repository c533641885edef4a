//! Shared test helpers and fixtures

#![allow(dead_code, reason = "Not every test crate uses every helper")]

use flate2::Compression;
use flate2::write::GzEncoder;
use std::io::Write;
use std::sync::Arc;
use std::sync::atomic::AtomicUsize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

/// Build a tar stream from (path, mode, content) triples.
pub fn tar_with_entries(entries: &[(&str, u32, &[u8])]) -> Vec<u8> {
    let mut builder = tar::Builder::new(Vec::new());
    for (path, mode, content) in entries {
        let mut header = tar::Header::new_gnu();
        header.set_size(content.len() as u64);
        header.set_mode(*mode);
        header.set_cksum();
        builder
            .append_data(&mut header, path, *content)
            .expect("append tar entry");
    }
    builder.into_inner().expect("finish tar")
}

pub fn gzip(bytes: &[u8]) -> Vec<u8> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(bytes).expect("gzip write");
    encoder.finish().expect("gzip finish")
}

/// Build a complete `.gem` archive for `name`/`version` with the given
/// payload entries.
pub fn build_gem_archive(name: &str, version: &str, payload: &[(&str, u32, &[u8])]) -> Vec<u8> {
    let metadata = format!(
        "--- !ruby/object:Gem::Specification\n\
         name: {name}\n\
         version: !ruby/object:Gem::Version\n\
         \x20\x20version: {version}\n\
         platform: ruby\n\
         authors:\n\
         - Tester\n\
         licenses:\n\
         - MIT\n\
         summary: Test gem {name}\n"
    );

    let metadata_gz = gzip(metadata.as_bytes());
    let data_tar_gz = gzip(&tar_with_entries(payload));

    tar_with_entries(&[
        ("metadata.gz", 0o644, metadata_gz.as_slice()),
        ("data.tar.gz", 0o644, data_tar_gz.as_slice()),
    ])
}

/// Serve `body` with a 200 for every request on a loopback listener.
///
/// Returns the base URL and a hit counter.
pub async fn serve_bytes(body: Vec<u8>) -> (String, Arc<AtomicUsize>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    let hits = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&hits);

    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                return;
            };
            counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            let body = body.clone();
            tokio::spawn(async move {
                let mut buf = [0u8; 4096];
                drop(socket.read(&mut buf).await);
                let header = format!(
                    "HTTP/1.1 200 OK\r\ncontent-length: {}\r\nconnection: close\r\n\r\n",
                    body.len()
                );
                drop(socket.write_all(header.as_bytes()).await);
                drop(socket.write_all(&body).await);
            });
        }
    });

    (format!("http://{addr}"), hits)
}
