use std::str::FromStr;

use clap::Parser;

use crate::descriptor::{QueryKey, SubscriptionDescriptor};

/// One `--watch` argument: `table` or `table?filter`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Watch {
    pub table: String,
    pub filter: Option<String>,
}

impl FromStr for Watch {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (table, filter) = match s.split_once('?') {
            Some((table, filter)) => (table, Some(filter.to_string())),
            None => (s, None),
        };
        if table.is_empty() {
            return Err(format!("missing table name in '{}'", s));
        }
        if filter.as_deref() == Some("") {
            return Err(format!("empty filter in '{}'", s));
        }
        Ok(Self { table: table.to_string(), filter })
    }
}

impl Watch {
    /// Query key `[table]`, or `[table, filter]` for a filtered watch.
    pub fn descriptor(&self) -> SubscriptionDescriptor {
        match &self.filter {
            Some(filter) => {
                SubscriptionDescriptor::new(self.table.as_str(), QueryKey::new([self.table.as_str(), filter.as_str()]))
                    .with_filter(filter.as_str())
            }
            None => SubscriptionDescriptor::new(self.table.as_str(), self.table.as_str()),
        }
    }
}

#[derive(Parser, Debug)]
#[command(name = "rs_realtime", about = "Watch realtime table changes and log cache invalidations")]
pub struct Options {
    /// Configuration file (without extension)
    #[arg(short, long, default_value = "config")]
    pub config: String,

    /// Table to watch, optionally filtered: `jobs` or `jobs?id=eq.5`
    #[arg(short, long = "watch")]
    pub watches: Vec<Watch>,

    /// Overrides logging.level
    #[arg(short, long)]
    pub log_level: Option<String>,

    /// Start with realtime disabled
    #[arg(long)]
    pub emergency: bool,
}
