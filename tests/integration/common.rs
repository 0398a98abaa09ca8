//! Common utilities for integration tests.
//!
//! Spawning the agent binary, a fake boss speaking the control protocol and
//! polling helpers.

use std::{
    collections::BTreeMap,
    net::SocketAddr,
    path::Path,
    process::{Child, Command, ExitStatus, Stdio},
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use tokio::{
    io::{AsyncReadExt as _, AsyncWriteExt as _},
    net::TcpListener,
    task::JoinHandle,
};

/// Guard that kills and waits on a child process when dropped.
pub struct KillOnDrop(pub Child);

impl Drop for KillOnDrop {
    fn drop(&mut self) {
        drop(self.0.kill());
        drop(self.0.wait());
    }
}

fn get_agent_bin() -> &'static str {
    env!("CARGO_BIN_EXE_nodeagent")
}

/// Spawn the agent with `config_path`.
pub fn spawn_agent(config_path: &Path) -> Child {
    Command::new(get_agent_bin())
        .args(["--config", config_path.to_str().unwrap()])
        .env("NODEAGENT_INTEGRATION_TEST", "1")
        .env_remove("BOSSNODE")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .expect("failed to start nodeagent")
}

/// Write `config_toml` into `dir` and return its path.
pub fn write_config(dir: &Path, config_toml: &str) -> std::path::PathBuf {
    let path = dir.join("nodeagent.toml");
    std::fs::write(&path, config_toml).expect("failed to write config");
    path
}

/// Poll the child until it exits or `timeout` passes.
pub async fn wait_for_exit(child: &mut Child, timeout: Duration) -> ExitStatus {
    let start = Instant::now();
    loop {
        if let Some(status) = child.try_wait().expect("failed to wait on child") {
            return status;
        }
        if start.elapsed() > timeout {
            panic!("agent did not exit within {timeout:?}");
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

/// Send SIGTERM to the child.
pub fn terminate(child: &Child) {
    let status = Command::new("kill")
        .args(["-TERM", &child.id().to_string()])
        .status()
        .expect("failed to run kill");
    assert!(status.success(), "kill failed");
}

#[derive(Default)]
struct Script {
    responses: BTreeMap<String, String>,
    requests: Vec<String>,
}

/// Boss stand-in: answers each command with a canned body and records the
/// requests (without the `VERSION=` prefix).
pub struct FakeBoss {
    pub addr: SocketAddr,
    script: Arc<Mutex<Script>>,
    task: JoinHandle<()>,
}

impl FakeBoss {
    pub async fn start(responses: &[(&str, &str)]) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let script = Arc::new(Mutex::new(Script {
            responses: responses
                .iter()
                .map(|&(command, body)| (command.to_owned(), body.to_owned()))
                .collect(),
            requests: Vec::new(),
        }));
        let task = tokio::spawn({
            let script = Arc::clone(&script);
            async move {
                while let Ok((mut socket, _)) = listener.accept().await {
                    let mut buf = vec![0_u8; 4096];
                    // Discovery connects without sending anything.
                    let n = match socket.read(&mut buf).await {
                        Ok(0) | Err(_) => continue,
                        Ok(n) => n,
                    };
                    let raw = String::from_utf8_lossy(&buf[..n]);
                    let request = raw
                        .trim()
                        .split_once(' ')
                        .map_or_else(|| raw.trim().to_owned(), |(_, rest)| rest.to_owned());
                    let command = request.split(' ').next().unwrap_or_default().to_owned();
                    let body = {
                        let mut script = script.lock().unwrap();
                        script.requests.push(request);
                        script.responses.get(&command).cloned().unwrap_or_default()
                    };
                    drop(socket.write_all(body.as_bytes()).await);
                }
            }
        });
        Self { addr, script, task }
    }

    pub fn requests(&self) -> Vec<String> {
        self.script.lock().unwrap().requests.clone()
    }

    /// Wait until `request` arrived or `timeout` passes.
    pub async fn wait_for(&self, request: &str, timeout: Duration) -> bool {
        let start = Instant::now();
        while start.elapsed() < timeout {
            if self.requests().iter().any(|r| r == request) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        false
    }
}

impl Drop for FakeBoss {
    fn drop(&mut self) {
        self.task.abort();
    }
}
