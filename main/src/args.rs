use clap::{Parser, Subcommand};
use common::storage::vector_store::SearchFilters;

#[derive(Parser, Debug)]
#[command(author, version, about = "Answer tax questions from an indexed IRS.gov corpus", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Answer a single question
    Ask {
        /// The question to answer
        query: String,

        /// Equality filter on chunk metadata, e.g. `content_type=pdf` (repeatable)
        #[arg(long = "filter", value_parser = parse_filter)]
        filters: Vec<(String, String)>,

        /// Rolling conversation summary to ground the answer in
        #[arg(long)]
        summary: Option<String>,

        /// Print the full answer as JSON
        #[arg(long)]
        json: bool,

        /// Print per-stage timings
        #[arg(long)]
        timings: bool,
    },

    /// Show vector size and point count for the configured collection
    Stats,

    /// Create the configured collection sized for the active embedding model
    EnsureCollection,

    /// Drop the configured collection and every point in it
    DeleteCollection {
        /// Confirm the deletion
        #[arg(long)]
        yes: bool,
    },
}

fn parse_filter(raw: &str) -> Result<(String, String), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got `{raw}`"))?;
    let (key, value) = (key.trim(), value.trim());
    if key.is_empty() || value.is_empty() {
        return Err(format!("expected key=value, got `{raw}`"));
    }
    Ok((key.to_string(), value.to_string()))
}

/// Later occurrences of a key replace earlier ones.
pub fn collect_filters(pairs: Vec<(String, String)>) -> SearchFilters {
    pairs.into_iter().collect()
}
