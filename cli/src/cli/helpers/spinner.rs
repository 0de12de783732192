use std::time::Duration;

use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};

use crate::logger::{INFO_SYMBOL, LOGGER_PREFIX};

/// A wrapper around an indicatif spinner
/// With custom styling from the logger
pub struct UmbraSpinner {
    pb: ProgressBar,
}

impl UmbraSpinner {
    pub fn new(msg: &str) -> Self {
        let prefix = format!("{} {}", LOGGER_PREFIX.bold().yellow(), INFO_SYMBOL.yellow());

        let pb = ProgressBar::new_spinner();
        let style = ProgressStyle::with_template(&format!("{}  {{spinner:.yellow}} {{msg}} ({{elapsed}})", prefix))
            .unwrap_or_else(|_| ProgressStyle::default_spinner());
        pb.set_style(style);
        pb.set_message(msg.to_string());
        pb.enable_steady_tick(Duration::from_millis(100));

        Self { pb }
    }

    pub fn set_message(&self, msg: String) {
        self.pb.set_message(msg);
    }

    pub fn finish(&self, msg: &str) {
        self.pb.finish_with_message(msg.to_string());
    }

    pub fn abandon(&self, msg: &str) {
        self.pb.abandon_with_message(msg.to_string());
    }
}
