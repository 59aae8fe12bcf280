//! CLI output formatting utilities.
//!
//! Provides consistent formatting for terminal output including colored status
//! messages, human-readable byte/duration formatting, and the per-source report.

use std::time::Duration;

use anyhow::Context;
use owo_colors::{OwoColorize, Stream};

use extcheck_lib::{ExternalSource, ExternalState, State};

#[derive(Debug, Clone, Copy, Default)]
pub enum OutputFormat {
  #[default]
  Text,
  Json,
}

impl OutputFormat {
  pub fn is_json(self) -> bool {
    matches!(self, OutputFormat::Json)
  }
}

pub mod symbols {
  pub const SUCCESS: &str = "✓";
  pub const ERROR: &str = "✗";
  pub const WARNING: &str = "⚠";
  pub const INFO: &str = "•";
  pub const MODIFY: &str = "~";
}

pub fn format_bytes(bytes: u64) -> String {
  const KB: u64 = 1024;
  const MB: u64 = KB * 1024;
  const GB: u64 = MB * 1024;

  if bytes >= GB {
    format!("{:.1} GB", bytes as f64 / GB as f64)
  } else if bytes >= MB {
    format!("{:.1} MB", bytes as f64 / MB as f64)
  } else if bytes >= KB {
    format!("{:.1} KB", bytes as f64 / KB as f64)
  } else {
    format!("{} B", bytes)
  }
}

pub fn format_duration(duration: Duration) -> String {
  let secs = duration.as_secs();
  let millis = duration.subsec_millis();

  if secs >= 60 {
    let mins = secs / 60;
    let remaining_secs = secs % 60;
    format!("{}m {}s", mins, remaining_secs)
  } else if secs > 0 {
    format!("{}.{:02}s", secs, millis / 10)
  } else {
    format!("{}ms", millis)
  }
}

pub fn print_success(message: &str) {
  println!(
    "{} {}",
    symbols::SUCCESS.if_supports_color(Stream::Stdout, |s| s.green()),
    message
  );
}

pub fn print_error(message: &str) {
  eprintln!(
    "{} {}",
    symbols::ERROR.if_supports_color(Stream::Stderr, |s| s.red()),
    message.if_supports_color(Stream::Stderr, |s| s.red())
  );
}

pub fn print_stat(label: &str, value: &str) {
  println!(
    "    {:<10} {}",
    format!("{}:", label).if_supports_color(Stream::Stdout, |s| s.dimmed()),
    value
  );
}

/// One block per outdated source: its state, then the candidate if any.
pub fn print_outdated(source: &ExternalSource) {
  let (symbol, label) = match source.state() {
    State::Broken => (symbols::ERROR, "BROKEN"),
    _ => (symbols::WARNING, "OUTDATED"),
  };
  println!(
    "{} {}: {}",
    symbol.if_supports_color(Stream::Stdout, |s| s.yellow()),
    label.if_supports_color(Stream::Stdout, |s| s.bold()),
    source.filename()
  );
  print_stat("Source", source.id());

  let Some(new_version) = source.new_version() else {
    return;
  };
  println!("  Has a new version:");
  match &new_version {
    ExternalState::File(file) => {
      print_stat("URL", &file.url);
      for kind in file.checksum.kinds() {
        if let Some(hex) = file.checksum.get(kind) {
          print_stat(kind.as_str(), hex);
        }
      }
      if let Some(size) = file.size {
        print_stat("Size", &format!("{} ({})", size, format_bytes(size)));
      }
      if let Some(changelog) = &file.changelog_url {
        print_stat("Changelog", changelog);
      }
    }
    ExternalState::Git(git) => {
      print_stat("URL", &git.url);
      for (label, value) in [("Tag", &git.tag), ("Branch", &git.branch), ("Commit", &git.commit)] {
        if let Some(value) = value {
          print_stat(label, value);
        }
      }
    }
  }
  if let Some(version) = new_version.version() {
    print_stat("Version", version);
  }
  if let Some(timestamp) = new_version.timestamp() {
    print_stat("Timestamp", &timestamp.to_rfc3339());
  }
}

pub fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
  let json = serde_json::to_string_pretty(value).context("Failed to serialize to JSON")?;
  println!("{}", json);
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_format_bytes() {
    assert_eq!(format_bytes(500), "500 B");
    assert_eq!(format_bytes(1024), "1.0 KB");
    assert_eq!(format_bytes(1536), "1.5 KB");
    assert_eq!(format_bytes(1048576), "1.0 MB");
    assert_eq!(format_bytes(1073741824), "1.0 GB");
  }

  #[test]
  fn test_format_duration() {
    assert_eq!(format_duration(Duration::from_millis(50)), "50ms");
    assert_eq!(format_duration(Duration::from_millis(1500)), "1.50s");
    assert_eq!(format_duration(Duration::from_secs(65)), "1m 5s");
  }
}
