/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

#![allow(dead_code)]

use axum::http::{StatusCode, Uri};
use axum::Router;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Serves `files` by request path and counts every request. Returns the
/// base url for tor downloads.
pub async fn serve(files: HashMap<String, Vec<u8>>) -> (String, Arc<AtomicUsize>) {
    let hits = Arc::new(AtomicUsize::new(0));
    let files = Arc::new(files);
    let counter = hits.clone();
    let app = Router::new().fallback(move |uri: Uri| {
        let files = files.clone();
        let counter = counter.clone();
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            match files.get(uri.path()) {
                Some(body) => (StatusCode::OK, body.clone()),
                None => (StatusCode::NOT_FOUND, Vec::new()),
            }
        }
    });
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("http://{addr}/tor"), hits)
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Packs `tor/tor` with `script` as its content into a tar.gz, the layout
/// of an expert bundle.
#[cfg(unix)]
pub fn tor_bundle(work: &Path, script: &str) -> Vec<u8> {
    use std::os::unix::fs::PermissionsExt;

    let tree = work.join(format!("tree-{}", rand_suffix()));
    std::fs::create_dir_all(tree.join("tor")).unwrap();
    let bin = tree.join("tor/tor");
    std::fs::write(&bin, script).unwrap();
    std::fs::set_permissions(&bin, std::fs::Permissions::from_mode(0o644)).unwrap();
    std::fs::write(tree.join("tor/geoip"), b"").unwrap();
    let archive = tree.with_extension("tar.gz");
    let status = std::process::Command::new("tar")
        .arg("-czf")
        .arg(&archive)
        .arg("-C")
        .arg(&tree)
        .arg("tor")
        .status()
        .unwrap();
    assert!(status.success());
    std::fs::read(&archive).unwrap()
}

fn rand_suffix() -> u32 {
    use std::sync::atomic::AtomicU32;
    static N: AtomicU32 = AtomicU32::new(0);
    N.fetch_add(1, Ordering::SeqCst)
}

/// A stand-in daemon: listens on the port from `--SocksPort 127.0.0.1:N`.
pub const FAKE_TOR: &str = r#"#!/bin/sh
port="${2##*:}"
exec python3 -c 'import socket, sys, time
s = socket.socket()
s.setsockopt(socket.SOL_SOCKET, socket.SO_REUSEADDR, 1)
s.bind(("127.0.0.1", int(sys.argv[1])))
s.listen(8)
time.sleep(600)' "$port"
"#;

pub const BROKEN_TOR: &str = "#!/bin/sh\necho 'bad config' >&2\nexit 3\n";

/// Runs but never opens its socks port.
pub const SILENT_TOR: &str = "#!/bin/sh\nexec sleep 600\n";

pub fn have_python3() -> bool {
    std::process::Command::new("python3")
        .arg("--version")
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}
