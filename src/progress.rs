//! Progress sinks for transfers
//!
//! The core only ever creates a sink and advances it; rendering belongs to
//! indicatif.

use indicatif::{MultiProgress, ProgressBar, ProgressStyle};

const BAR_TEMPLATE: &str =
    "{msg:.dim} [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec}, {eta})";

/// Creates progress sinks; cheap to clone
#[derive(Clone)]
pub struct ProgressFactory {
    multi: Option<MultiProgress>,
}

impl ProgressFactory {
    /// Create a factory that renders bars when `enabled`
    pub fn new(enabled: bool) -> Self {
        Self {
            multi: enabled.then(MultiProgress::new),
        }
    }

    /// A factory whose sinks only count
    pub fn hidden() -> Self {
        Self { multi: None }
    }

    /// New sink for a transfer of `total_bytes`
    pub fn new_sink(&self, total_bytes: u64, label: impl Into<String>) -> ProgressSink {
        let bar = match &self.multi {
            Some(multi) => {
                let pb = multi.add(ProgressBar::new(total_bytes));
                if let Ok(style) = ProgressStyle::default_bar().template(BAR_TEMPLATE) {
                    pb.set_style(style.progress_chars("=>-"));
                }
                pb.set_message(truncate_label(&label.into(), 40));
                pb
            }
            None => {
                let pb = ProgressBar::hidden();
                pb.set_length(total_bytes);
                pb
            }
        };
        ProgressSink { bar }
    }

    /// Print a line without corrupting active bars
    pub fn println(&self, msg: &str) {
        match &self.multi {
            Some(multi) => {
                multi.println(msg).ok();
            }
            None => println!("{}", msg),
        }
    }
}

/// Byte counter for one transfer
#[derive(Clone)]
pub struct ProgressSink {
    bar: ProgressBar,
}

impl ProgressSink {
    /// Record `bytes` more transferred
    pub fn advance(&self, bytes: u64) {
        self.bar.inc(bytes);
    }

    /// Bytes recorded so far
    pub fn position(&self) -> u64 {
        self.bar.position()
    }

    /// Mark the transfer complete
    pub fn finish(&self) {
        self.bar.finish_and_clear();
    }
}

/// Truncate a label for display
fn truncate_label(name: &str, max_len: usize) -> String {
    let count = name.chars().count();
    if count <= max_len {
        name.to_string()
    } else {
        let tail: String = name.chars().skip(count - (max_len - 3)).collect();
        format!("...{}", tail)
    }
}

/// Format a byte count for display
pub fn format_size(bytes: u64) -> String {
    human_bytes::human_bytes(bytes as f64)
}
