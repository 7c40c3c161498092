//! Navigator against an in-process Alist look-alike.

use alistnav::{Attachment, Inbound, Navigator, Outbox, Reply, Settings};
use axum::body::{Body, Bytes};
use axum::extract::{DefaultBodyLimit, Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, Notify};

const TOKEN: &str = "fake-token";
const MIB: usize = 1024 * 1024;

/// How `/d/*` answers.
const SERVE_FILES: usize = 0;
const SERVE_ERROR: usize = 1;
const SERVE_TRUNCATED: usize = 2;
const SERVE_OVERSIZED: usize = 3;

#[derive(Default)]
struct FakeAlist {
    dirs: Mutex<HashMap<String, Vec<Value>>>,
    files: Mutex<HashMap<String, Vec<u8>>>,
    logins: AtomicUsize,
    lists: AtomicUsize,
    puts: AtomicUsize,
    download_mode: AtomicUsize,
    hold_puts: AtomicBool,
    put_entered: Notify,
    put_release: Notify,
}

type Shared = Arc<FakeAlist>;

fn entry(name: &str, is_dir: bool, size: usize) -> Value {
    json!({
        "name": name,
        "size": if is_dir { 0 } else { size },
        "is_dir": is_dir,
        "modified": "2024-05-01T10:00:00.000+08:00",
        "sign": "",
        "thumb": "",
        "type": if is_dir { 1 } else { 0 },
    })
}

fn split_parent(path: &str) -> (String, String) {
    match path.rsplit_once('/') {
        Some(("", name)) => ("/".to_string(), name.to_string()),
        Some((parent, name)) => (parent.to_string(), name.to_string()),
        None => ("/".to_string(), path.to_string()),
    }
}

impl FakeAlist {
    fn seeded() -> Shared {
        let fake = FakeAlist::default();
        {
            let mut dirs = fake.dirs.lock().unwrap();
            let mut files = fake.files.lock().unwrap();
            dirs.insert(
                "/".to_string(),
                vec![
                    entry("readme.txt", false, 10),
                    entry("docs", true, 0),
                    entry("movies", true, 0),
                    entry("notes.md", false, 20),
                    entry("music", true, 0),
                ],
            );
            dirs.insert(
                "/docs".to_string(),
                vec![entry("reports", true, 0), entry("a.txt", false, 5)],
            );
            dirs.insert("/docs/reports".to_string(), Vec::new());
            dirs.insert("/movies".to_string(), vec![entry("big.bin", false, 25 * MIB)]);
            dirs.insert("/music".to_string(), Vec::new());

            files.insert("/readme.txt".to_string(), b"0123456789".to_vec());
            files.insert("/notes.md".to_string(), vec![b'n'; 20]);
            files.insert("/docs/a.txt".to_string(), b"hello".to_vec());
            files.insert("/movies/big.bin".to_string(), vec![7u8; 25 * MIB]);
        }
        Arc::new(fake)
    }

    fn find(&self, path: &str) -> Option<Value> {
        if path == "/" {
            return Some(entry("root", true, 0));
        }
        let (parent, name) = split_parent(path);
        let dirs = self.dirs.lock().unwrap();
        dirs.get(&parent)?
            .iter()
            .find(|e| e["name"] == name.as_str())
            .cloned()
    }
}

fn authorized(headers: &HeaderMap) -> bool {
    headers.get(header::AUTHORIZATION).and_then(|v| v.to_str().ok()) == Some(TOKEN)
}

fn ok(data: Value) -> Json<Value> {
    Json(json!({ "code": 200, "message": "success", "data": data }))
}

fn fail(code: u16, message: &str) -> Json<Value> {
    Json(json!({ "code": code, "message": message, "data": null }))
}

async fn login(State(fake): State<Shared>, Json(body): Json<Value>) -> Json<Value> {
    fake.logins.fetch_add(1, Ordering::SeqCst);
    if body["username"] == "admin" && body["password"] == "pw" {
        ok(json!({ "token": TOKEN }))
    } else {
        fail(400, "password is incorrect")
    }
}

async fn list(State(fake): State<Shared>, headers: HeaderMap, Json(body): Json<Value>) -> Json<Value> {
    if !authorized(&headers) {
        return fail(401, "token is invalidated");
    }
    fake.lists.fetch_add(1, Ordering::SeqCst);
    let path = body["path"].as_str().unwrap_or("/");
    let dirs = fake.dirs.lock().unwrap();
    match dirs.get(path) {
        Some(content) => ok(json!({ "content": content, "total": content.len() })),
        None => fail(500, "object not found"),
    }
}

async fn stat(State(fake): State<Shared>, headers: HeaderMap, Json(body): Json<Value>) -> Json<Value> {
    if !authorized(&headers) {
        return fail(401, "token is invalidated");
    }
    match fake.find(body["path"].as_str().unwrap_or("/")) {
        Some(found) => ok(found),
        None => fail(500, "object not found"),
    }
}

async fn search(State(fake): State<Shared>, headers: HeaderMap, Json(body): Json<Value>) -> Json<Value> {
    if !authorized(&headers) {
        return fail(401, "token is invalidated");
    }
    let parent = body["parent"].as_str().unwrap_or("/").to_string();
    let keyword = body["keywords"].as_str().unwrap_or_default().to_string();
    let dirs = fake.dirs.lock().unwrap();
    let mut hits: Vec<Value> = Vec::new();
    let mut keys: Vec<&String> = dirs.keys().filter(|k| k.starts_with(&parent)).collect();
    keys.sort();
    for dir in keys {
        for e in &dirs[dir] {
            if e["name"].as_str().unwrap_or_default().contains(&keyword) {
                let mut hit = e.clone();
                hit["parent"] = json!(dir);
                hits.push(hit);
            }
        }
    }
    ok(json!({ "content": hits, "total": hits.len() }))
}

async fn upload(State(fake): State<Shared>, headers: HeaderMap, body: Bytes) -> Json<Value> {
    if !authorized(&headers) {
        return fail(401, "token is invalidated");
    }
    fake.puts.fetch_add(1, Ordering::SeqCst);
    if fake.hold_puts.load(Ordering::SeqCst) {
        fake.put_entered.notify_one();
        fake.put_release.notified().await;
    }
    let raw = headers
        .get("File-Path")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    let path = urlencoding::decode(raw).unwrap().into_owned();
    let (parent, name) = split_parent(&path);

    fake.dirs
        .lock()
        .unwrap()
        .entry(parent)
        .or_default()
        .push(entry(&name, false, body.len()));
    fake.files.lock().unwrap().insert(path, body.to_vec());
    ok(Value::Null)
}

async fn raw(State(fake): State<Shared>, headers: HeaderMap, Path(path): Path<String>) -> Response {
    if !authorized(&headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    let path = format!("/{}", path);
    let Some(content) = fake.files.lock().unwrap().get(&path).cloned() else {
        return StatusCode::NOT_FOUND.into_response();
    };

    match fake.download_mode.load(Ordering::SeqCst) {
        SERVE_ERROR => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
        SERVE_TRUNCATED => {
            // Half the file, then the connection breaks
            let half = Bytes::from(content[..content.len() / 2].to_vec());
            let chunks: Vec<Result<Bytes, std::io::Error>> = vec![
                Ok(half),
                Err(std::io::Error::new(std::io::ErrorKind::ConnectionReset, "cut")),
            ];
            Body::from_stream(tokio_stream::iter(chunks)).into_response()
        }
        SERVE_OVERSIZED => vec![0u8; 2 * MIB].into_response(),
        _ => content.into_response(),
    }
}

async fn spawn_fake(fake: Shared) -> String {
    let app = Router::new()
        .route("/api/auth/login", post(login))
        .route("/api/fs/list", post(list))
        .route("/api/fs/get", post(stat))
        .route("/api/fs/search", post(search))
        .route("/api/fs/put", put(upload))
        .route("/d/*path", get(raw))
        .layer(DefaultBodyLimit::disable())
        .with_state(fake);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{}", addr)
}

struct Harness {
    fake: Shared,
    nav: Navigator,
    outbox: Outbox,
    rx: mpsc::Receiver<Reply>,
    _data: tempfile::TempDir,
}

impl Harness {
    async fn start() -> Self {
        Self::with(|_| {}).await
    }

    async fn with(tweak: impl FnOnce(&mut Settings)) -> Self {
        let fake = FakeAlist::seeded();
        let base = spawn_fake(fake.clone()).await;
        let data = tempfile::tempdir().unwrap();
        let mut settings = Settings {
            default_alist_url: base,
            default_username: "admin".to_string(),
            default_password: "pw".to_string(),
            data_dir: Some(data.path().display().to_string()),
            ..Settings::default()
        };
        tweak(&mut settings);

        let (outbox, rx) = Outbox::channel(256);
        Self {
            fake,
            nav: Navigator::new(settings),
            outbox,
            rx,
            _data: data,
        }
    }

    async fn send(&mut self, text: &str) -> Vec<Reply> {
        self.nav.handle(Inbound::command("alice", text), &self.outbox).await;
        self.drain()
    }

    async fn attach(&mut self, attachment: Attachment) -> Vec<Reply> {
        self.nav
            .handle(Inbound::attachment("alice", attachment), &self.outbox)
            .await;
        self.drain()
    }

    fn drain(&mut self) -> Vec<Reply> {
        let mut replies = Vec::new();
        while let Ok(reply) = self.rx.try_recv() {
            replies.push(reply);
        }
        replies
    }

    async fn path_and_ancestors(&self) -> (String, Vec<String>) {
        let session = self.nav.sessions().get("alice").unwrap();
        let state = session.lock().await;
        (
            state.nav.current_path().to_string(),
            state.nav.ancestors().to_vec(),
        )
    }

    fn downloads_dir_is_empty(&self) -> bool {
        let dir = self._data.path().join("downloads");
        match std::fs::read_dir(&dir) {
            Ok(mut entries) => entries.next().is_none(),
            Err(_) => true,
        }
    }

    async fn upload_waiting(&self) -> bool {
        let session = self.nav.sessions().get("alice").unwrap();
        let waiting = session.lock().await.upload.is_waiting();
        waiting
    }
}

fn text(replies: &[Reply]) -> String {
    replies
        .iter()
        .filter_map(Reply::as_text)
        .collect::<Vec<_>>()
        .join("\n---\n")
}

fn files(replies: &[Reply]) -> Vec<(String, std::path::PathBuf)> {
    replies
        .iter()
        .filter_map(|r| match r {
            Reply::File { name, path } => Some((name.clone(), path.clone())),
            Reply::Text(_) => None,
        })
        .collect()
}

#[tokio::test]
async fn test_navigate_into_directory_and_back() {
    let mut h = Harness::start().await;

    let out = text(&h.send("ls /").await);
    assert!(out.contains("3 directories, 2 files"), "{}", out);
    // Directories are numbered before files
    assert!(out.contains(" 1. [dir] docs/"), "{}", out);
    assert!(out.contains(" 2. [dir] movies/"), "{}", out);
    assert!(out.contains(" 4. readme.txt"), "{}", out);
    assert_eq!(h.path_and_ancestors().await, ("/".to_string(), vec![]));

    let out = text(&h.send("ls 2").await);
    assert!(out.starts_with("/movies"), "{}", out);
    assert_eq!(
        h.path_and_ancestors().await,
        ("/movies".to_string(), vec!["/".to_string()])
    );

    let out = text(&h.send("quit").await);
    assert!(out.starts_with("back to /"), "{}", out);
    assert_eq!(h.path_and_ancestors().await, ("/".to_string(), vec![]));

    let out = text(&h.send("/alist quit").await);
    assert!(out.contains("already at the root"), "{}", out);
}

#[tokio::test]
async fn test_relative_and_unrelated_moves() {
    let mut h = Harness::start().await;

    h.send("ls /docs").await;
    h.send("ls reports").await;
    assert_eq!(
        h.path_and_ancestors().await,
        ("/docs/reports".to_string(), vec!["/".to_string(), "/docs".to_string()])
    );

    // Jumping sideways switches directory without growing the history
    h.send("ls /music").await;
    assert_eq!(
        h.path_and_ancestors().await,
        ("/music".to_string(), vec!["/".to_string(), "/docs".to_string()])
    );

    let out = text(&h.send("ls 1").await);
    assert!(out.contains("invalid index 1"), "{}", out);
}

#[tokio::test]
async fn test_listing_cache_and_clear() {
    let mut h = Harness::start().await;

    let first = text(&h.send("ls /").await);
    assert!(!first.contains("(cached)"));
    let second = text(&h.send("ls /").await);
    assert!(second.contains("(cached)"), "{}", second);
    assert_eq!(h.fake.lists.load(Ordering::SeqCst), 1);

    let out = text(&h.send("config clear_cache").await);
    assert_eq!(out, "cleared 1 cached listings");

    h.send("ls /").await;
    assert_eq!(h.fake.lists.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_cache_disabled_always_asks_server() {
    let mut h = Harness::with(|s| s.enable_cache = false).await;
    h.send("ls /").await;
    h.send("ls /").await;
    assert_eq!(h.fake.lists.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_download_small_file_by_index() {
    let mut h = Harness::start().await;
    h.send("ls /").await;

    let replies = h.send("ls 4").await;
    let out = text(&replies);
    assert!(out.contains("preparing download: readme.txt"), "{}", out);
    assert!(!out.contains("progress"), "{}", out);

    let sent = files(&replies);
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].0, "readme.txt");
    assert_eq!(std::fs::read(&sent[0].1).unwrap(), b"0123456789");
    assert!(sent[0].1.file_name().unwrap().to_string_lossy().starts_with("alice_"));

    // Selecting a file does not change directory
    assert_eq!(h.path_and_ancestors().await, ("/".to_string(), vec![]));
}

#[tokio::test]
async fn test_large_download_reports_progress() {
    let mut h = Harness::start().await;
    h.send("ls /movies").await;

    let replies = h.send("download 1").await;
    let out = text(&replies);
    assert_eq!(out.matches("progress:").count(), 2, "{}", out);

    let sent = files(&replies);
    assert_eq!(sent.len(), 1);
    let size = std::fs::metadata(&sent[0].1).unwrap().len();
    assert_eq!(size, (25 * MIB) as u64);
}

#[tokio::test]
async fn test_download_over_limit_is_refused() {
    let mut h = Harness::with(|s| s.max_download_size = 10).await;
    h.send("ls /movies").await;

    let replies = h.send("ls 1").await;
    assert!(files(&replies).is_empty());
    let out = text(&replies);
    assert!(out.contains("file too large: 25.0 MB > 10.0 MB"), "{}", out);
}

#[tokio::test]
async fn test_download_http_error_is_reported() {
    let mut h = Harness::start().await;
    h.fake.download_mode.store(SERVE_ERROR, Ordering::SeqCst);
    h.send("ls /").await;

    let replies = h.send("ls 4").await;
    assert!(files(&replies).is_empty());
    let out = text(&replies);
    assert!(out.contains("transfer failed"), "{}", out);
    assert!(h.downloads_dir_is_empty());
}

#[tokio::test]
async fn test_interrupted_download_leaves_no_partial_file() {
    let mut h = Harness::start().await;
    h.fake.download_mode.store(SERVE_TRUNCATED, Ordering::SeqCst);
    h.send("ls /movies").await;

    let replies = h.send("download 1").await;
    assert!(files(&replies).is_empty());
    let out = text(&replies);
    assert!(out.contains("transfer failed"), "{}", out);
    assert!(h.downloads_dir_is_empty());
}

#[tokio::test]
async fn test_body_larger_than_listed_size_is_cut_off() {
    let mut h = Harness::with(|s| s.max_download_size = 1).await;
    // readme.txt is listed at 10 bytes but the server sends 2 MiB
    h.fake.download_mode.store(SERVE_OVERSIZED, Ordering::SeqCst);
    h.send("ls /").await;

    let replies = h.send("ls 4").await;
    assert!(files(&replies).is_empty());
    let out = text(&replies);
    assert!(out.contains("file too large"), "{}", out);
    assert!(out.contains("> 1.0 MB"), "{}", out);
    assert!(h.downloads_dir_is_empty());
}

#[tokio::test]
async fn test_ls_on_a_file_path() {
    let mut h = Harness::start().await;
    let out = text(&h.send("ls /readme.txt").await);
    assert!(out.contains("/readme.txt is not a directory"), "{}", out);

    let out = text(&h.send("ls /missing").await);
    assert!(out.contains("cannot access /missing"), "{}", out);
    assert_eq!(h.path_and_ancestors().await, ("/".to_string(), vec![]));
}

#[tokio::test]
async fn test_download_by_path_gives_link() {
    let mut h = Harness::start().await;

    let out = text(&h.send("download /docs/a.txt").await);
    assert!(out.contains("file: a.txt"), "{}", out);
    assert!(out.contains("/d/docs/a.txt"), "{}", out);

    let out = text(&h.send("download /docs").await);
    assert!(out.contains("is a directory"), "{}", out);

    h.send("ls /").await;
    let out = text(&h.send("download 1").await);
    assert!(out.contains("docs is a directory"), "{}", out);
}

#[tokio::test]
async fn test_info_and_search() {
    let mut h = Harness::start().await;

    let out = text(&h.send("info /readme.txt").await);
    assert!(out.contains("size: 10 B"), "{}", out);
    assert!(out.contains("modified: 2024-05-01 10:00:00"), "{}", out);
    assert!(out.contains("/d/readme.txt"), "{}", out);

    let out = text(&h.send("info /nope").await);
    assert!(out.contains("not found: /nope"), "{}", out);

    let out = text(&h.send("search a.txt").await);
    assert!(out.contains("1. a.txt"), "{}", out);
    assert!(out.contains("in /docs"), "{}", out);

    let out = text(&h.send("search zzz").await);
    assert_eq!(out, "no results for 'zzz'");
}

#[tokio::test]
async fn test_upload_into_current_directory() {
    let mut h = Harness::start().await;
    let local = tempfile::tempdir().unwrap();
    let file = local.path().join("incoming");
    std::fs::write(&file, b"hello world").unwrap();

    h.send("ls /docs").await;
    let out = text(&h.send("upload").await);
    assert!(out.contains("target: /docs"), "{}", out);
    assert!(h.upload_waiting().await);

    let out = text(
        &h.attach(Attachment::File {
            name: "hello.txt".to_string(),
            path: file,
        })
        .await,
    );
    assert!(out.contains("upload complete"), "{}", out);
    assert!(out.contains("hello.txt"), "{}", out);
    assert!(!h.upload_waiting().await);
    assert_eq!(h.fake.puts.load(Ordering::SeqCst), 1);
    assert_eq!(
        h.fake.files.lock().unwrap().get("/docs/hello.txt").cloned(),
        Some(b"hello world".to_vec())
    );

    // The cached listing of /docs was dropped, so the new file shows up
    let out = text(&h.send("ls /docs").await);
    assert!(!out.contains("(cached)"), "{}", out);
    assert!(out.contains("hello.txt"), "{}", out);

    // Out of upload mode, attachments are ignored
    let again = local.path().join("again");
    std::fs::write(&again, b"x").unwrap();
    let replies = h
        .attach(Attachment::File {
            name: "again.txt".to_string(),
            path: again,
        })
        .await;
    assert!(replies.is_empty());
    assert_eq!(h.fake.puts.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_image_upload_is_renamed() {
    let mut h = Harness::start().await;
    let local = tempfile::tempdir().unwrap();
    let image = local.path().join("photo.png");
    std::fs::write(&image, b"\x89PNG").unwrap();

    h.send("upload").await;
    h.attach(Attachment::Image { path: image }).await;

    let files = h.fake.files.lock().unwrap();
    let uploaded: Vec<&String> = files.keys().filter(|k| k.starts_with("/image_")).collect();
    assert_eq!(uploaded.len(), 1);
    assert!(uploaded[0].ends_with(".png"));
}

#[tokio::test]
async fn test_oversized_upload_never_calls_put() {
    let mut h = Harness::with(|s| s.max_upload_size = 1).await;
    let local = tempfile::tempdir().unwrap();
    let file = local.path().join("big");
    std::fs::write(&file, vec![0u8; MIB + 1]).unwrap();

    h.send("upload").await;
    let out = text(
        &h.attach(Attachment::File {
            name: "big.bin".to_string(),
            path: file,
        })
        .await,
    );
    assert!(out.contains("file too large"), "{}", out);
    assert_eq!(h.fake.puts.load(Ordering::SeqCst), 0);
    assert!(!h.upload_waiting().await);
}

#[tokio::test]
async fn test_new_upload_wait_survives_running_upload() {
    let mut h = Harness::start().await;
    let local = tempfile::tempdir().unwrap();
    let file = local.path().join("slow");
    std::fs::write(&file, b"slow body").unwrap();

    h.send("ls /docs").await;
    h.send("upload").await;
    h.fake.hold_puts.store(true, Ordering::SeqCst);

    let first = h.nav.handle(
        Inbound::attachment(
            "alice",
            Attachment::File {
                name: "slow.txt".to_string(),
                path: file,
            },
        ),
        &h.outbox,
    );
    let meanwhile = async {
        h.fake.put_entered.notified().await;
        // The running upload already claimed the first wait
        let session = h.nav.sessions().get("alice").unwrap();
        assert!(!session.lock().await.upload.is_waiting());

        h.nav.handle(Inbound::command("alice", "upload"), &h.outbox).await;
        h.fake.put_release.notify_one();
    };
    tokio::join!(first, meanwhile);

    let out = text(&h.drain());
    assert!(out.contains("upload complete"), "{}", out);
    assert!(h.upload_waiting().await, "second wait was ended by the first upload");
    assert_eq!(h.fake.puts.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_config_test_reports_bad_credentials() {
    let mut h = Harness::start().await;
    let out = text(&h.send("config test").await);
    assert!(out.starts_with("connected to http://127.0.0.1:"), "{}", out);

    h.send("config set password wrong").await;
    let out = text(&h.send("config test").await);
    assert!(out.contains("connection failed"), "{}", out);
    assert!(h.fake.logins.load(Ordering::SeqCst) >= 2);
}

#[tokio::test]
async fn test_users_are_isolated() {
    let mut h = Harness::start().await;
    h.send("ls /docs").await;

    h.nav
        .handle(Inbound::command("bob", "ls /music"), &h.outbox)
        .await;
    h.drain();

    assert_eq!(h.path_and_ancestors().await.0, "/docs");
    let bob = h.nav.sessions().get("bob").unwrap();
    assert_eq!(bob.lock().await.nav.current_path(), "/music");
}
