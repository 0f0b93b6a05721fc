/// In-memory stand-in for a running server, shared by the saga and action tests.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, watch};

use crate::correlation::{Correlator, ServerIo};

type Reply = Box<dyn Fn(&str) -> Vec<String> + Send>;

/// Records every command written to it and answers with canned console lines.
pub struct FakeServer {
    io: ServerIo,
    commands: Arc<Mutex<Vec<String>>>,
    stop_tx: watch::Sender<bool>,
}

impl FakeServer {
    pub fn new(reply: impl Fn(&str) -> Vec<String> + Send + 'static) -> Self {
        let reply: Reply = Box::new(reply);
        let (input_tx, mut input_rx) = mpsc::channel::<String>(16);
        let (lines_tx, lines_rx) = mpsc::channel::<String>(64);
        let (stop_tx, stop_rx) = watch::channel(false);
        let (correlator, _engine) = Correlator::spawn(lines_rx, stop_rx);
        let commands = Arc::new(Mutex::new(Vec::new()));

        let log = Arc::clone(&commands);
        tokio::spawn(async move {
            while let Some(cmd) = input_rx.recv().await {
                log.lock().unwrap().push(cmd.clone());
                for line in reply(&cmd) {
                    if lines_tx.send(line).await.is_err() {
                        return;
                    }
                }
            }
        });

        Self {
            io: ServerIo::new(input_tx, correlator),
            commands,
            stop_tx,
        }
    }

    /// A Paper console with `online` players connected.
    pub fn paper(online: usize) -> Self {
        Self::new(move |cmd| paper_reply(cmd, online))
    }

    pub fn io(&self) -> ServerIo {
        self.io.clone()
    }

    /// Commands received so far, once the fake has caught up with its queue.
    pub async fn commands(&self) -> Vec<String> {
        tokio::time::sleep(Duration::from_millis(10)).await;
        self.commands.lock().unwrap().clone()
    }

    /// Makes the fake look like a process that just died.
    pub fn kill(&self) {
        let _ = self.stop_tx.send(true);
    }
}

pub fn paper_reply(cmd: &str, online: usize) -> Vec<String> {
    let lines: &[&str] = match cmd {
        "save-off" => &["[12:00:00 INFO]: Automatic saving is now disabled"],
        "save-all" => &[
            "[12:00:00 INFO]: Saving the game (this may take a moment!)",
            "[12:00:01 INFO]: Saved the game",
        ],
        "save-on" => &["[12:00:02 INFO]: Automatic saving is now enabled"],
        "list" => {
            return vec![format!(
                "[12:00:00 INFO]: There are {online} of a max of 20 players online: "
            )]
        }
        _ => &[],
    };
    lines.iter().map(|l| l.to_string()).collect()
}
