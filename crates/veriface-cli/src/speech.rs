//! Line-oriented input. One reader thread owns stdin; prompts and the
//! spoken-challenge transcripts both consume its channel.

use std::io::BufRead;

use anyhow::{bail, Result};
use tokio::sync::mpsc;

const LINE_BUFFER: usize = 16;

/// Forward each line of `reader` into a channel from a dedicated thread.
/// The channel closes at end of input.
pub fn spawn_line_reader<R>(reader: R) -> mpsc::Receiver<String>
where
    R: BufRead + Send + 'static,
{
    let (tx, rx) = mpsc::channel(LINE_BUFFER);
    std::thread::spawn(move || {
        for line in reader.lines() {
            let Ok(line) = line else { break };
            if tx.blocking_send(line).is_err() {
                break;
            }
        }
    });
    rx
}

pub fn stdin_lines() -> mpsc::Receiver<String> {
    spawn_line_reader(std::io::BufReader::new(std::io::stdin()))
}

/// Print `label` to stderr and wait for the next non-empty line.
pub async fn prompt(lines: &mut mpsc::Receiver<String>, label: &str) -> Result<String> {
    eprint!("{label}: ");
    loop {
        match lines.recv().await {
            Some(line) if line.trim().is_empty() => continue,
            Some(line) => return Ok(line.trim().to_string()),
            None => bail!("input closed before {label} was entered"),
        }
    }
}
