use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Args, Subcommand};
use helpdesk_stream::cursor;

use crate::config::{FileConfig, default_cursor_path};

#[derive(Args)]
pub struct CursorArgs {
    #[command(subcommand)]
    action: CursorAction,

    /// Cursor file (default: cursor.json in the config directory)
    #[arg(long, global = true)]
    cursor: Option<PathBuf>,
}

#[derive(Subcommand, Clone, Copy, Debug, PartialEq, Eq)]
enum CursorAction {
    /// Print the saved cursor as JSON
    Show,
    /// Delete the saved cursor
    Reset,
}

pub fn cursor_command(config: &FileConfig, config_dir: &Path, args: CursorArgs) -> Result<()> {
    let path = args
        .cursor
        .or_else(|| config.follow.cursor_path.clone())
        .unwrap_or_else(|| default_cursor_path(config_dir));

    match args.action {
        CursorAction::Show => {
            let saved = cursor::load(&path)
                .with_context(|| format!("Failed to load cursor {}", path.display()))?;
            println!("{}", serde_json::to_string_pretty(&saved)?);
            if let (Ok(base_url), Ok(account_id)) = (config.base_url(), config.account_id()) {
                if saved.last_seen_message_id > 0 && !saved.matches(base_url, account_id) {
                    eprintln!(
                        "note: this cursor belongs to {} account {} and will be ignored by --resume",
                        saved.base_url, saved.account_id
                    );
                }
            }
        }
        CursorAction::Reset => {
            if cursor::remove(&path)? {
                eprintln!("Removed {}", path.display());
            } else {
                eprintln!("No cursor at {}", path.display());
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use helpdesk_stream::FollowCursor;

    fn args(action: CursorAction, path: &Path) -> CursorArgs {
        CursorArgs {
            action,
            cursor: Some(path.to_path_buf()),
        }
    }

    #[test]
    fn show_then_reset() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cursor.json");
        let mut saved = FollowCursor::new("https://desk.example.com", 1);
        saved.last_seen_message_id = 42;
        cursor::save(&path, &saved).unwrap();

        let config = FileConfig::default();
        cursor_command(&config, dir.path(), args(CursorAction::Show, &path)).unwrap();
        cursor_command(&config, dir.path(), args(CursorAction::Reset, &path)).unwrap();
        assert!(!path.exists());
        // Resetting twice is fine
        cursor_command(&config, dir.path(), args(CursorAction::Reset, &path)).unwrap();
    }

    #[test]
    fn show_rejects_malformed_cursor() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cursor.json");
        std::fs::write(&path, "nope").unwrap();
        let err = cursor_command(&FileConfig::default(), dir.path(), args(CursorAction::Show, &path))
            .unwrap_err();
        assert!(err.to_string().contains("Failed to load cursor"));
    }
}
