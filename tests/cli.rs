use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use tempfile::TempDir;

fn qm_binary() -> PathBuf {
    let mut path = std::env::current_exe().unwrap();
    path.pop(); // remove test binary name
    path.pop(); // remove deps/
    path.push("qm");
    path
}

fn write_config(root: &Path, provider: &str, port: u16) -> PathBuf {
    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();

    let config_content = format!(
        r#"[db]
path = "{}/data/qm.sqlite"

[embedding]
provider = "{}"
dims = 384

[similarity]
threshold = 0.75

[server]
bind = "127.0.0.1:{}"
"#,
        root.display(),
        provider,
        port
    );

    let config_path = config_dir.join("qm.toml");
    fs::write(&config_path, config_content).unwrap();
    config_path
}

fn setup_test_env() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let config_path = write_config(tmp.path(), "hash", 8000);
    (tmp, config_path)
}

fn run_qm(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = qm_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .args(args)
        .output()
        .unwrap_or_else(|e| panic!("Failed to run qm binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    let success = output.status.success();
    (stdout, stderr, success)
}

/// Add a quote and return its id from the "Created quote <id>" line.
fn add_quote(config_path: &Path, text: &str, author: &str) -> String {
    let (stdout, stderr, success) = run_qm(config_path, &["add", text, "--author", author]);
    assert!(success, "add failed: stdout={}, stderr={}", stdout, stderr);
    stdout
        .lines()
        .find_map(|l| l.strip_prefix("Created quote "))
        .unwrap_or_else(|| panic!("no id in output: {}", stdout))
        .trim()
        .to_string()
}

fn seed_scenario(config_path: &Path) -> (String, String, String) {
    let a = add_quote(
        config_path,
        "The only true wisdom is in knowing you know nothing",
        "Socrates",
    );
    let b = add_quote(
        config_path,
        "The only true wisdom is knowing you know nothing",
        "Socrates",
    );
    let c = add_quote(config_path, "Stay hungry, stay foolish", "Steve Jobs");
    (a, b, c)
}

#[test]
fn test_init_creates_database() {
    let (tmp, config_path) = setup_test_env();

    let (stdout, stderr, success) = run_qm(&config_path, &["init"]);
    assert!(success, "init failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("initialized"));
    assert!(tmp.path().join("data/qm.sqlite").exists());
}

#[test]
fn test_init_idempotent() {
    let (_tmp, config_path) = setup_test_env();

    let (_, _, success1) = run_qm(&config_path, &["init"]);
    assert!(success1, "First init failed");

    let (_, _, success2) = run_qm(&config_path, &["init"]);
    assert!(success2, "Second init failed (not idempotent)");
}

#[test]
fn test_missing_config_fails() {
    let tmp = TempDir::new().unwrap();
    let (_, stderr, success) = run_qm(&tmp.path().join("nope.toml"), &["init"]);
    assert!(!success);
    assert!(stderr.contains("Failed to read config file"), "stderr: {}", stderr);
}

#[test]
fn test_recompute_empty_library() {
    let (_tmp, config_path) = setup_test_env();
    run_qm(&config_path, &["init"]);

    let (stdout, stderr, success) = run_qm(&config_path, &["recompute"]);
    assert!(success, "recompute failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("edges created: 0"));
    assert!(stdout.contains("clusters found: 0"));
}

#[test]
fn test_near_duplicates_linked_and_clustered() {
    let (_tmp, config_path) = setup_test_env();
    run_qm(&config_path, &["init"]);
    let (a, b, c) = seed_scenario(&config_path);

    let (stdout, stderr, success) = run_qm(&config_path, &["recompute"]);
    assert!(success, "recompute failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("quotes processed: 3"), "{}", stdout);
    assert!(stdout.contains("edges created: 1"), "{}", stdout);
    assert!(stdout.contains("clusters found: 1"), "{}", stdout);
    assert!(stdout.contains("noise: 1"), "{}", stdout);

    // The near-duplicates share a cluster; the outlier is noise
    let (stdout, _, _) = run_qm(&config_path, &["list", "--cluster", "0"]);
    assert!(stdout.contains(&a));
    assert!(stdout.contains(&b));
    assert!(!stdout.contains(&c));

    let (stdout, _, success) = run_qm(&config_path, &["similarity", &a, &b]);
    assert!(success);
    let sim: f64 = stdout.trim().parse().unwrap();
    assert!(sim >= 0.75, "similarity {}", sim);

    let (stdout, _, success) = run_qm(&config_path, &["similar", &a, "--top-k", "1"]);
    assert!(success);
    assert!(stdout.contains(&b));
    assert!(!stdout.contains(&c));
}

#[test]
fn test_add_same_text_merges() {
    let (_tmp, config_path) = setup_test_env();
    run_qm(&config_path, &["init"]);
    let id = add_quote(&config_path, "Know thyself", "Anonymous");

    let (stdout, _, success) = run_qm(
        &config_path,
        &["add", "Know thyself", "--author", "Socrates", "--source", "Delphi"],
    );
    assert!(success);
    assert!(stdout.contains(&format!("Merged into existing quote {}", id)));

    let (stdout, _, _) = run_qm(&config_path, &["get", &id]);
    assert!(stdout.contains("Socrates"));
    assert!(stdout.contains("Delphi"));
}

#[test]
fn test_edit_and_remove() {
    let (_tmp, config_path) = setup_test_env();
    run_qm(&config_path, &["init"]);
    let id = add_quote(&config_path, "Carpe diem", "Horace");

    let (stdout, stderr, success) =
        run_qm(&config_path, &["edit", &id, "--text", "Carpe diem, quam minimum credula postero"]);
    assert!(success, "edit failed: {}", stderr);
    assert!(stdout.contains("quam minimum"));

    let (_, _, success) = run_qm(&config_path, &["remove", &id]);
    assert!(success);

    let (_, stderr, success) = run_qm(&config_path, &["get", &id]);
    assert!(!success);
    assert!(stderr.contains("not found"), "stderr: {}", stderr);
}

#[test]
fn test_disabled_provider_rejects_add() {
    let tmp = TempDir::new().unwrap();
    let config_dir = tmp.path().join("config");
    fs::create_dir_all(&config_dir).unwrap();
    let config_path = config_dir.join("qm.toml");
    fs::write(
        &config_path,
        format!("[db]\npath = \"{}/data/qm.sqlite\"\n", tmp.path().display()),
    )
    .unwrap();
    run_qm(&config_path, &["init"]);

    let (_, stderr, success) = run_qm(&config_path, &["add", "Hello", "--author", "World"]);
    assert!(!success);
    assert!(stderr.contains("embedding provider unavailable"), "stderr: {}", stderr);

    let (stdout, _, _) = run_qm(&config_path, &["list"]);
    assert!(stdout.contains("No quotes found."));
}

#[test]
fn test_import_and_stats() {
    let (tmp, config_path) = setup_test_env();
    run_qm(&config_path, &["init"]);

    let file = tmp.path().join("quotes.json");
    fs::write(
        &file,
        r#"[
            {"text": "The unexamined life is not worth living", "author": "Socrates"},
            {"text": "I think therefore I am", "author": "Descartes", "source": "Discourse on the Method"},
            {"text": "", "author": "Nobody"}
        ]"#,
    )
    .unwrap();

    let (stdout, stderr, success) = run_qm(&config_path, &["import", file.to_str().unwrap()]);
    assert!(success, "import failed: {}", stderr);
    assert!(stdout.contains("created: 2"), "{}", stdout);
    assert!(stdout.contains("failed:  1"), "{}", stdout);

    let (stdout, _, success) = run_qm(&config_path, &["stats"]);
    assert!(success);
    assert!(stdout.contains("Quotes:      2"), "{}", stdout);
    assert!(stdout.contains("People:      2"), "{}", stdout);
    assert!(stdout.contains("Last run:    never"));
}

#[test]
fn test_graph_export() {
    let (tmp, config_path) = setup_test_env();
    run_qm(&config_path, &["init"]);
    seed_scenario(&config_path);
    run_qm(&config_path, &["recompute"]);

    let out = tmp.path().join("out/graph.json");
    let (_, stderr, success) = run_qm(&config_path, &["graph", "--output", out.to_str().unwrap()]);
    assert!(success, "graph failed: {}", stderr);

    let graph: serde_json::Value = serde_json::from_str(&fs::read_to_string(&out).unwrap()).unwrap();
    let nodes = graph["nodes"].as_array().unwrap();
    let edges = graph["edges"].as_array().unwrap();
    // 3 quotes + 2 people
    assert_eq!(nodes.len(), 5);
    assert_eq!(
        edges.iter().filter(|e| e["type"] == "attributed_to").count(),
        3
    );
    assert_eq!(edges.iter().filter(|e| e["type"] == "similar_to").count(), 1);
}

// ============ HTTP server ============

fn find_free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

fn start_server(config_path: &Path) -> std::process::Child {
    Command::new(qm_binary())
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .arg("serve")
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .unwrap_or_else(|e| panic!("Failed to start server: {}", e))
}

/// Wait for the server to be ready by polling the health endpoint.
fn wait_for_server(port: u16) {
    let url = format!("http://127.0.0.1:{}/health", port);
    for _ in 0..50 {
        std::thread::sleep(std::time::Duration::from_millis(100));
        if let Ok(resp) = reqwest::blocking::get(&url) {
            if resp.status().is_success() {
                return;
            }
        }
    }
    panic!("Server did not become ready within 5 seconds");
}

#[test]
fn test_server_quote_lifecycle() {
    let port = find_free_port();
    let tmp = TempDir::new().unwrap();
    let config_path = write_config(tmp.path(), "hash", port);
    run_qm(&config_path, &["init"]);

    let mut server = start_server(&config_path);
    wait_for_server(port);
    let base = format!("http://127.0.0.1:{}", port);
    let client = reqwest::blocking::Client::new();

    let resp = client
        .post(format!("{}/quotes", base))
        .json(&serde_json::json!({"text": "Simplicity is the ultimate sophistication", "author": "Leonardo"}))
        .send()
        .unwrap();
    assert_eq!(resp.status(), 201);
    let quote: serde_json::Value = resp.json().unwrap();
    let id = quote["id"].as_str().unwrap().to_string();
    assert_eq!(quote["author"]["name"], "Leonardo");

    let resp = client
        .post(format!("{}/quotes", base))
        .json(&serde_json::json!({"text": "  ", "author": "Leonardo"}))
        .send()
        .unwrap();
    assert_eq!(resp.status(), 400);
    let body: serde_json::Value = resp.json().unwrap();
    assert_eq!(body["error"]["code"], "bad_request");

    let resp = client
        .post(format!("{}/people", base))
        .json(&serde_json::json!({"name": "Leonardo"}))
        .send()
        .unwrap();
    assert_eq!(resp.status(), 409);

    let resp = client
        .post(format!("{}/analytics/recompute", base))
        .send()
        .unwrap();
    assert_eq!(resp.status(), 200);
    let summary: serde_json::Value = resp.json().unwrap();
    assert_eq!(summary["quotes_processed"], 1);

    let resp = client
        .post(format!("{}/analytics/recompute", base))
        .json(&serde_json::json!({"threshold": 2.0}))
        .send()
        .unwrap();
    assert_eq!(resp.status(), 400);

    let resp = client.get(format!("{}/quotes/{}", base, id)).send().unwrap();
    assert_eq!(resp.status(), 200);
    let detail: serde_json::Value = resp.json().unwrap();
    assert_eq!(detail["quote"]["id"], id.as_str());
    assert!(detail["similar"].as_array().unwrap().is_empty());

    let resp = client.get(format!("{}/analytics/stats", base)).send().unwrap();
    let stats: serde_json::Value = resp.json().unwrap();
    assert_eq!(stats["total_quotes"], 1);

    let resp = client.delete(format!("{}/quotes/{}", base, id)).send().unwrap();
    assert_eq!(resp.status(), 204);

    let resp = client.get(format!("{}/quotes/{}", base, id)).send().unwrap();
    assert_eq!(resp.status(), 404);
    let body: serde_json::Value = resp.json().unwrap();
    assert_eq!(body["error"]["code"], "not_found");

    server.kill().ok();
    server.wait().ok();
}
