//! A scripted boss for tests: answers each command with a canned body and
//! records what it was asked.

use alloc::{collections::BTreeMap, sync::Arc};
use core::{net::SocketAddr, time::Duration};
use std::sync::Mutex;

use tokio::{
    io::{AsyncReadExt as _, AsyncWriteExt as _},
    net::TcpListener,
    task::JoinHandle,
    time::{Instant, sleep},
};

#[derive(Default)]
struct Script {
    responses: BTreeMap<String, String>,
    requests: Vec<String>,
}

pub(crate) struct FakeBoss {
    addr: SocketAddr,
    script: Arc<Mutex<Script>>,
    task: JoinHandle<()>,
}

impl FakeBoss {
    pub(crate) async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let script = Arc::new(Mutex::new(Script::default()));
        let task = tokio::spawn({
            let script = Arc::clone(&script);
            async move {
                loop {
                    let Ok((mut socket, _)) = listener.accept().await else {
                        return;
                    };
                    let mut buf = vec![0_u8; 4096];
                    // Discovery connects without sending anything.
                    let n = match socket.read(&mut buf).await {
                        Ok(0) | Err(_) => continue,
                        Ok(n) => n,
                    };
                    let request = String::from_utf8_lossy(&buf[..n]);
                    let request = request
                        .trim()
                        .split_once(' ')
                        .map_or_else(|| request.trim().to_owned(), |(_, rest)| rest.to_owned());
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

    pub(crate) const fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub(crate) fn respond(&self, command: &str, body: &str) {
        self.script
            .lock()
            .unwrap()
            .responses
            .insert(command.to_owned(), body.to_owned());
    }

    /// Requests received so far, without the version prefix (`state ISUP`, `mounts`).
    pub(crate) fn requests(&self) -> Vec<String> {
        self.script.lock().unwrap().requests.clone()
    }

    /// Wait until `request` has been received.
    pub(crate) async fn wait_for(&self, request: &str, limit: Duration) -> bool {
        let deadline = Instant::now() + limit;
        while Instant::now() < deadline {
            if self.requests().iter().any(|r| r == request) {
                return true;
            }
            sleep(Duration::from_millis(10)).await;
        }
        false
    }
}

impl Drop for FakeBoss {
    fn drop(&mut self) {
        self.task.abort();
    }
}
