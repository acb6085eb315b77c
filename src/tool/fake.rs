//! In-process stand-in for steamcmd used by unit tests
//!
//! Reads the generated script like the real tool would, writes steamcmd-style
//! log lines, and materializes item files under the forced install dir.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use super::traits::{InstanceRun, InstanceRunner, Invocation, ProcessExit};
use crate::error::{Error, Result};
use crate::isolation::content_root;
use crate::types::ItemId;
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::fmt::Write as _;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

/// What the fake tool does with one item on one attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Behavior {
    /// Write the files and print a success line
    Download,
    /// Print a success line without writing any files
    ClaimOnly,
    /// Print `[AppID N] Download item X result : <reason>`
    Result(&'static str),
    /// Print `ERROR! Download item X failed (Rate Limit Exceeded)`
    RateLimited,
    /// Never finish; the whole instance ends in a hard timeout
    Hang,
}

/// One recorded launch
#[derive(Debug, Clone)]
pub(crate) struct Launch {
    pub pass: u32,
    pub slot: usize,
    pub items: Vec<ItemId>,
}

/// Scripted [`InstanceRunner`]; items without a script always download
#[derive(Debug, Default)]
pub(crate) struct ScriptedRunner {
    script: Mutex<HashMap<ItemId, VecDeque<Behavior>>>,
    fail_spawn_slots: Mutex<Vec<(u32, usize)>>,
    launches: Mutex<Vec<Launch>>,
}

impl ScriptedRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue behaviors for an item, one per attempt
    pub fn script(self, id: &str, behaviors: &[Behavior]) -> Self {
        self.script
            .lock()
            .unwrap()
            .entry(ItemId::from(id))
            .or_default()
            .extend(behaviors.iter().copied());
        self
    }

    /// Make the launch of `slot` in `pass` fail as if the binary could not start
    pub fn fail_spawn(self, pass: u32, slot: usize) -> Self {
        self.fail_spawn_slots.lock().unwrap().push((pass, slot));
        self
    }

    pub fn launches(&self) -> Vec<Launch> {
        self.launches.lock().unwrap().clone()
    }

    fn next_behavior(&self, id: &ItemId) -> Behavior {
        self.script
            .lock()
            .unwrap()
            .get_mut(id)
            .and_then(VecDeque::pop_front)
            .unwrap_or(Behavior::Download)
    }
}

struct ParsedScript {
    install_root: PathBuf,
    app_id: String,
    items: Vec<ItemId>,
}

fn parse_script(text: &str) -> ParsedScript {
    let mut parsed = ParsedScript {
        install_root: PathBuf::new(),
        app_id: String::new(),
        items: Vec::new(),
    };
    for line in text.lines() {
        let mut words = line.split_whitespace();
        match words.next() {
            Some("force_install_dir") => {
                parsed.install_root = PathBuf::from(words.collect::<Vec<_>>().join(" "));
            }
            Some("workshop_download_item") => {
                if let (Some(app), Some(id)) = (words.next(), words.next()) {
                    parsed.app_id = app.to_string();
                    parsed.items.push(ItemId::from(id));
                }
            }
            _ => {}
        }
    }
    parsed
}

#[async_trait]
impl InstanceRunner for ScriptedRunner {
    async fn run(&self, invocation: &Invocation) -> Result<InstanceRun> {
        let script = std::fs::read_to_string(&invocation.script_path)?;
        let parsed = parse_script(&script);
        self.launches.lock().unwrap().push(Launch {
            pass: invocation.pass,
            slot: invocation.slot,
            items: parsed.items.clone(),
        });

        if self
            .fail_spawn_slots
            .lock()
            .unwrap()
            .contains(&(invocation.pass, invocation.slot))
        {
            return Err(Error::ExternalTool(
                "Failed to execute steamcmd: No such file or directory".into(),
            ));
        }

        let mut log = String::from("Steam Console Client (c) Valve Corporation\n");
        let mut hung = false;
        let app = &parsed.app_id;
        for id in &parsed.items {
            match self.next_behavior(id) {
                Behavior::Download => {
                    let dir = content_root(&parsed.install_root, app).join(id.as_str());
                    std::fs::create_dir_all(&dir)?;
                    std::fs::write(dir.join("item.bin"), b"workshop")?;
                    let _ = writeln!(log, "Success. Downloaded item {id} to \"{}\"", dir.display());
                }
                Behavior::ClaimOnly => {
                    let _ = writeln!(log, "Success. Downloaded item {id}");
                }
                Behavior::Result(reason) => {
                    let _ = writeln!(log, "[AppID {app}] Download item {id} result : {reason}");
                }
                Behavior::RateLimited => {
                    let _ = writeln!(log, "ERROR! Download item {id} failed (Rate Limit Exceeded)");
                }
                Behavior::Hang => {
                    hung = true;
                    break;
                }
            }
        }
        std::fs::write(&invocation.log_path, log)?;

        let exit = if hung {
            ProcessExit::HardTimeout
        } else if invocation.cancel.is_cancelled() {
            ProcessExit::Cancelled
        } else {
            ProcessExit::Completed { code: Some(0) }
        };
        Ok(InstanceRun {
            exit,
            elapsed: Duration::from_millis(1),
        })
    }

    fn name(&self) -> &'static str {
        "scripted"
    }
}
