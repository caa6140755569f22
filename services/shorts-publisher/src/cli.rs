//! Command-line interface

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use youtube_upload::PrivacyStatus;

/// Authorize and upload generated shorts
#[derive(Parser, Debug)]
#[command(name = "shorts-publisher", version, about, long_about = None)]
pub struct Cli {
    /// TOML config file (falls back to CONFIG_PATH, then ./shorts-publisher.toml)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Resolve an upload credential, running interactive consent if needed
    Auth,
    /// Upload a rendered video
    Upload(UploadArgs),
    /// Encode a provider-issued client JSON into the at-rest identity form
    EncodeIdentity {
        /// Client JSON downloaded from the provider console
        #[arg(long)]
        input: PathBuf,
        /// Where to write the encoded document (stdout when omitted)
        #[arg(long)]
        output: Option<PathBuf>,
    },
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::Auth => "auth",
            Command::Upload(_) => "upload",
            Command::EncodeIdentity { .. } => "encode-identity",
        }
    }
}

#[derive(Args, Debug)]
pub struct UploadArgs {
    /// Media file to upload
    #[arg(long)]
    pub file: PathBuf,

    #[arg(long)]
    pub title: String,

    #[arg(long, default_value = "")]
    pub description: String,

    /// Numeric category id (defaults to upload.category)
    #[arg(long)]
    pub category: Option<String>,

    /// Repeat for several tags
    #[arg(long = "tag")]
    pub tags: Vec<String>,

    /// private, unlisted or public (defaults to upload.privacy_status)
    #[arg(long)]
    pub privacy: Option<PrivacyStatus>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_upload_with_repeated_tags() {
        let cli = Cli::try_parse_from([
            "shorts-publisher",
            "--config",
            "/etc/shorts.toml",
            "upload",
            "--file",
            "out/short.mp4",
            "--title",
            "Ocean facts",
            "--tag",
            "shorts",
            "--tag",
            "facts",
            "--privacy",
            "public",
        ])
        .unwrap();

        assert_eq!(cli.config, Some(PathBuf::from("/etc/shorts.toml")));
        let Command::Upload(args) = cli.command else {
            panic!("expected upload command");
        };
        assert_eq!(args.tags, vec!["shorts", "facts"]);
        assert_eq!(args.privacy, Some(PrivacyStatus::Public));
        assert_eq!(args.description, "");
        assert!(args.category.is_none());
    }

    #[test]
    fn rejects_unknown_privacy() {
        let result = Cli::try_parse_from([
            "shorts-publisher",
            "upload",
            "--file",
            "a.mp4",
            "--title",
            "t",
            "--privacy",
            "friends-only",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn config_flag_is_global() {
        let cli = Cli::try_parse_from(["shorts-publisher", "auth", "--config", "c.toml"]).unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("c.toml")));
        assert_eq!(cli.command.name(), "auth");
    }
}
