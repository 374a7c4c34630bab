// Test Helpers
use near_testbed::{Contract, KeyPair, SandboxConfig, Session};
use serde_json::json;
use std::{
    fs,
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
    time::Duration,
};
use tempfile::TempDir;

#[allow(dead_code)]
pub const COUNTER_WASM_PATH: &str = concat!(
    env!("CARGO_MANIFEST_DIR"),
    "/contracts/counter/target/near/counter.wasm"
);

/// Node key the shell fakes write on `init`.
#[allow(dead_code)]
pub const FAKE_NODE_KEY: &str = "ed25519:9W2bDSmvaSTEBnC5mrbsCR4ywqcXo8ktPNhczTgHyaES";

/// Stand-in for the sandbox binary that answers JSON-RPC like a node.
///
/// `run` serves `status` with the node key from `<home>/node_key.json` and answers
/// every other method with an empty object. It leaves `pid` and a `launches` counter in
/// the home directory and reads two switches from there: `launch_delay` (seconds to
/// wait before serving on every launch after the first) and `ignore_sigterm`.
const RPC_SANDBOX: &str = r#"#!/usr/bin/env python3
import json
import os
import signal
import sys
import time
from http.server import BaseHTTPRequestHandler, HTTPServer

home, command = sys.argv[2], sys.argv[3]
if command == "init":
    sys.exit(0)


def path(name):
    return os.path.join(home, name)


with open(path("pid"), "w") as f:
    f.write(str(os.getpid()))
launches = 1
if os.path.exists(path("launches")):
    with open(path("launches")) as f:
        launches = int(f.read()) + 1
with open(path("launches"), "w") as f:
    f.write(str(launches))
if launches > 1 and os.path.exists(path("launch_delay")):
    with open(path("launch_delay")) as f:
        time.sleep(float(f.read()))
if os.path.exists(path("ignore_sigterm")):
    signal.signal(signal.SIGTERM, signal.SIG_IGN)

os.makedirs(path("data"), exist_ok=True)
with open(path("node_key.json")) as f:
    node_key = json.load(f)["public_key"]
host, port = sys.argv[sys.argv.index("--rpc-addr") + 1].rsplit(":", 1)


class Rpc(BaseHTTPRequestHandler):
    def do_POST(self):
        request = json.loads(self.rfile.read(int(self.headers["Content-Length"])))
        result = {}
        if request["method"] == "status":
            result = {
                "chain_id": "localnet",
                "node_public_key": node_key,
                "validator_account_id": "test.near",
            }
        body = json.dumps({"jsonrpc": "2.0", "id": request["id"], "result": result}).encode()
        self.send_response(200)
        self.send_header("Content-Type", "application/json")
        self.send_header("Content-Length", str(len(body)))
        self.end_headers()
        self.wfile.write(body)

    def log_message(self, *args):
        pass


HTTPServer((host, int(port)), Rpc).serve_forever()
"#;

fn write_executable(path: &Path, script: &str) {
    fs::write(path, script).unwrap();
    fs::set_permissions(path, fs::Permissions::from_mode(0o755)).unwrap();
}

/// Writes an executable shell script standing in for the sandbox binary.
///
/// `init` runs `init_body` and then writes validator and node keys like the real
/// binary; `run` executes `run_body`.
#[allow(dead_code)]
pub fn fake_sandbox_with(dir: &TempDir, init_body: &str, run_body: &str) -> PathBuf {
    let path = dir.path().join("fake-sandbox");
    let script = format!(
        r#"#!/bin/sh
home="$2"
if [ "$3" = "init" ]; then
  {init_body}
  echo '{{"account_id": "test.near", "secret_key": "ed25519:unused"}}' > "$home/validator_key.json"
  echo '{{"account_id": "node", "public_key": "{FAKE_NODE_KEY}", "secret_key": "ed25519:unused"}}' > "$home/node_key.json"
  exit 0
fi
echo $$ > "$home/pid"
{run_body}
"#
    );
    write_executable(&path, &script);
    path
}

#[allow(dead_code)]
pub fn fake_sandbox(dir: &TempDir, run_body: &str) -> PathBuf {
    fake_sandbox_with(dir, ":", run_body)
}

#[allow(dead_code)]
pub fn fake_config(dir: &TempDir, run_body: &str) -> SandboxConfig {
    let home = dir.path().join("home");
    SandboxConfig::default()
        .with_binary(fake_sandbox(dir, run_body))
        .with_home_dir(home)
        .with_startup_timeout(Duration::from_secs(2))
        .with_stop_grace_period(Duration::from_millis(200))
}

/// Config for the answering fake, with a home already holding usable keys so the
/// session can sign as the root account.
#[allow(dead_code)]
pub fn rpc_fake_config(dir: &TempDir) -> SandboxConfig {
    let home = dir.path().join("home");
    fs::create_dir_all(&home).unwrap();
    let root_key = KeyPair::generate().unwrap();
    let node_key = KeyPair::generate().unwrap();
    fs::write(
        home.join("validator_key.json"),
        json!({"account_id": "test.near", "secret_key": root_key.secret_key().to_string()}).to_string(),
    )
    .unwrap();
    fs::write(
        home.join("node_key.json"),
        json!({
            "account_id": "node",
            "public_key": node_key.public_key().to_string(),
            "secret_key": node_key.secret_key().to_string(),
        })
        .to_string(),
    )
    .unwrap();

    let binary = dir.path().join("rpc-sandbox");
    write_executable(&binary, RPC_SANDBOX);
    SandboxConfig::default()
        .with_binary(binary)
        .with_home_dir(home)
        .with_startup_timeout(Duration::from_secs(10))
        .with_stop_grace_period(Duration::from_millis(500))
}

/// Replaces the sandbox binary without touching the running process. The new file is
/// renamed into place so the old one stays intact for whoever is executing it.
#[allow(dead_code)]
pub fn swap_binary(config: &SandboxConfig, script: &str) {
    let staged = config.binary.with_extension("next");
    write_executable(&staged, script);
    fs::rename(&staged, &config.binary).unwrap();
}

#[allow(dead_code)]
pub fn pid_file(home: &Path) -> i32 {
    fs::read_to_string(home.join("pid"))
        .unwrap()
        .trim()
        .parse()
        .unwrap()
}

#[allow(dead_code)]
pub fn real_session() -> Session {
    Session::from_env().expect("NEAR_SANDBOX_BIN_PATH must point at a sandbox binary")
}

#[allow(dead_code)]
pub fn deploy_counter(session: &Session, starting_count: u64) -> Contract {
    session
        .deploy_with_init("counter", COUNTER_WASM_PATH, "new", json!({ "starting_count": starting_count }))
        .unwrap()
}

#[allow(dead_code)]
pub fn get_count(counter: &Contract) -> u64 {
    counter.view("get_count", json!({})).unwrap().json_as::<u64>().unwrap()
}
