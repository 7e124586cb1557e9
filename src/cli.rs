//! Minimal CLI parsing for one-shot operator actions.

use std::env;
use std::path::PathBuf;

use crate::queue::QueueName;

#[derive(Debug, Default, PartialEq, Eq)]
pub struct CliOptions {
    /// Start every queue paused, overriding `QUEUE_START_PAUSED`
    pub start_paused: bool,
    /// Queues to clear before dispatch begins
    pub clear: Vec<QueueName>,
    /// Files to hash at user priority
    pub hash: Vec<PathBuf>,
    /// AniDB anime ids to fetch at user priority
    pub anidb: Vec<u64>,
    pub validate_images: bool,
}

impl CliOptions {
    pub fn from_args() -> Self {
        Self::parse(env::args().skip(1))
    }

    pub fn parse(args: impl IntoIterator<Item = String>) -> Self {
        let mut options = CliOptions::default();
        let mut args = args.into_iter();
        while let Some(arg) = args.next() {
            let (flag, inline) = match arg.split_once('=') {
                Some((flag, value)) if flag.starts_with("--") => (flag.to_string(), Some(value.to_string())),
                _ => (arg, None),
            };
            match flag.as_str() {
                "--paused" => options.start_paused = true,
                "--validate-images" => options.validate_images = true,
                "--clear" => {
                    if let Some(value) = inline.or_else(|| args.next()) {
                        match value.parse() {
                            Ok(queue) => options.clear.push(queue),
                            Err(e) => eprintln!("ignoring --clear: {}", e),
                        }
                    }
                }
                "--hash" => {
                    if let Some(value) = inline.or_else(|| args.next()) {
                        options.hash.push(PathBuf::from(value));
                    }
                }
                "--anidb" => {
                    if let Some(value) = inline.or_else(|| args.next()) {
                        match value.parse() {
                            Ok(id) => options.anidb.push(id),
                            Err(_) => eprintln!("ignoring --anidb: '{}' is not an anime id", value),
                        }
                    }
                }
                _ => {}
            }
        }
        options
    }
}
