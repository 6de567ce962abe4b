use anyhow::{Result, anyhow, bail};
use output_core::{Device, OutputSnapshot};

/// One console command.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    List,
    Status,
    Json,
    /// Add or remove a device from the selection, by UID or list index.
    Toggle(String),
    Volume { target: String, level: f32 },
    Refresh,
    /// Change and persist the refresh interval, in seconds.
    Interval(u64),
    Help,
    Quit,
}

pub const HELP: &str = "\
commands:
  list                     show output devices
  status                   show routing state
  json                     dump the current state as JSON
  toggle <uid|#>           add or remove a device from the selection
  volume <uid|#> <0..1>    set a device's volume
  refresh                  rescan devices now
  interval <secs>          change the refresh interval
  help                     this text
  quit                     restore the original output and exit";

impl Command {
    /// Parse one input line. Blank lines yield `None`.
    pub fn parse(line: &str) -> Result<Option<Command>> {
        let mut words = line.split_whitespace();
        let Some(verb) = words.next() else {
            return Ok(None);
        };
        let args: Vec<&str> = words.collect();
        let cmd = match (verb.to_ascii_lowercase().as_str(), args.as_slice()) {
            ("list" | "ls", []) => Command::List,
            ("status", []) => Command::Status,
            ("json", []) => Command::Json,
            ("toggle" | "t", [target]) => Command::Toggle(target.to_string()),
            ("volume" | "vol", [target, level]) => Command::Volume {
                target: target.to_string(),
                level: parse_level(level)?,
            },
            ("refresh", []) => Command::Refresh,
            ("interval", [secs]) => Command::Interval(
                secs.parse()
                    .map_err(|_| anyhow!("not a number of seconds: {}", secs))?,
            ),
            ("help" | "?", []) => Command::Help,
            ("quit" | "exit" | "q", []) => Command::Quit,
            (verb, _) => bail!("unknown command or wrong arguments: {} (try `help`)", verb),
        };
        Ok(Some(cmd))
    }
}

/// Accepts `0.7` or `70%`.
fn parse_level(text: &str) -> Result<f32> {
    let (number, scale) = match text.strip_suffix('%') {
        Some(pct) => (pct, 100.0),
        None => (text, 1.0),
    };
    let level: f32 = number
        .parse()
        .map_err(|_| anyhow!("not a volume level: {}", text))?;
    if !level.is_finite() {
        bail!("not a volume level: {}", text);
    }
    Ok(level / scale)
}

/// Find a device by exact UID, or by its 1-based position in the device list.
pub fn resolve_device(snapshot: &OutputSnapshot, target: &str) -> Option<Device> {
    if let Some(d) = snapshot.devices.iter().find(|d| d.uid == target) {
        return Some(d.clone());
    }
    let index: usize = target.trim_start_matches('#').parse().ok()?;
    snapshot.devices.get(index.checked_sub(1)?).cloned()
}
