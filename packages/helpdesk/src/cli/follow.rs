use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::Args;
use helpdesk_stream::{
    AssigneeFilter, ChannelDescriptor, CursorWriter, EventRouter, FilterConfig, FollowConfig, Follower,
    OutputEmitter, OverflowMode, cursor,
};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::cli::build_client;
use crate::config::{FileConfig, default_cursor_path};

#[derive(Args, Debug)]
pub struct FollowArgs {
    /// Only this conversation
    #[arg(long)]
    conversation: Option<u64>,

    /// Comma-separated event names to pass (default: all)
    #[arg(long, value_delimiter = ',')]
    events: Vec<String>,

    /// Only conversations in this inbox
    #[arg(long)]
    inbox: Option<u64>,

    /// Only conversations with this status (open, pending, resolved, snoozed)
    #[arg(long)]
    status: Option<String>,

    /// Only conversations with this priority
    #[arg(long)]
    priority: Option<String>,

    /// Only conversations assigned to this agent id, or `none` for unassigned
    #[arg(long)]
    assignee: Option<AssigneeFilter>,

    /// Only conversations carrying this label (repeatable; all must match)
    #[arg(long = "label")]
    labels: Vec<String>,

    /// Only messages from contacts
    #[arg(long)]
    incoming_only: bool,

    /// Include private notes
    #[arg(long)]
    include_private: bool,

    /// Skip messages created before this time (RFC 3339 or unix seconds)
    #[arg(long)]
    since: Option<String>,

    /// Debounce window in milliseconds (0 disables batching)
    #[arg(long)]
    debounce_ms: Option<u64>,

    /// Flush a conversation's batch once it holds this many messages
    #[arg(long)]
    max_batch: Option<usize>,

    /// Output queue capacity
    #[arg(long)]
    queue_size: Option<usize>,

    /// What to do when the output queue is full: drop or block
    #[arg(long)]
    overflow: Option<OverflowMode>,

    /// Cursor file (enables cursor saving)
    #[arg(long)]
    cursor: Option<PathBuf>,

    /// Resume after the last message recorded in the cursor
    #[arg(long)]
    resume: bool,

    /// Emit a snapshot the first time each conversation is seen
    #[arg(long)]
    snapshot: bool,

    /// Disable the presence heartbeat
    #[arg(long)]
    no_presence: bool,

    /// Write connect/disconnect status records to the output
    #[arg(long)]
    status_records: bool,
}

pub async fn follow_command(
    config: &FileConfig,
    config_dir: &Path,
    args: FollowArgs,
    cancel: CancellationToken,
) -> Result<()> {
    let base_url = config.base_url()?.to_string();
    let account_id = config.account_id()?;
    let client = build_client(config, &cancel)?;

    let channel = ChannelDescriptor {
        channel: config.follow.channel.clone(),
        pubsub_token: config
            .pubsub_token
            .clone()
            .context("pubsub_token is not configured (config.toml or HDESK_PUBSUB_TOKEN)")?,
        account_id,
        user_id: config
            .user_id
            .context("user_id is not configured (config.toml or HDESK_USER_ID)")?,
    };
    let follow_config = follow_config(config, &args, channel)?;
    let filter = filter_config(&args)?;

    let cursor_path = args
        .cursor
        .clone()
        .or_else(|| config.follow.cursor_path.clone())
        .unwrap_or_else(|| default_cursor_path(config_dir));

    let mut router = EventRouter::new(client, filter);
    let mut persisted = 0;
    if args.resume {
        let saved = cursor::load(&cursor_path)
            .with_context(|| format!("Failed to load cursor {}", cursor_path.display()))?;
        let start = saved.resume_point(&base_url, account_id, 0);
        if saved.matches(&base_url, account_id) {
            persisted = saved.last_seen_message_id;
        }
        info!(path = %cursor_path.display(), last_seen = start, "resuming");
        router = router.with_last_seen(start);
    }
    if args.snapshot {
        router = router.with_snapshots(config.follow.snapshot_limits());
    }

    let queue_size = args.queue_size.unwrap_or(config.follow.queue_size);
    let overflow = args.overflow.unwrap_or(config.follow.overflow);
    let emitter = OutputEmitter::new(io::stdout(), queue_size, overflow)
        .context("Failed to start the output thread")?
        .with_cancellation(cancel.clone());

    let mut follower = Follower::new(follow_config, router, emitter);
    if args.resume || args.cursor.is_some() {
        follower = follower.with_cursor(CursorWriter::new(
            cursor_path,
            &base_url,
            account_id,
            persisted,
            Duration::from_millis(config.follow.cursor_min_interval_ms),
        ));
    }

    let summary = follower.run(cancel).await?;
    info!(
        messages = summary.messages,
        events = summary.events,
        dropped = summary.dropped,
        "done"
    );
    Ok(())
}

fn follow_config(config: &FileConfig, args: &FollowArgs, channel: ChannelDescriptor) -> Result<FollowConfig> {
    let presence_interval = if args.no_presence {
        None
    } else {
        config.follow.presence_interval()
    };
    Ok(FollowConfig {
        websocket_url: config.websocket_url()?,
        channel,
        debounce_window: Duration::from_millis(args.debounce_ms.unwrap_or(config.follow.debounce_ms)),
        max_batch: args.max_batch.unwrap_or(config.follow.max_batch),
        presence_interval,
        backoff: config.follow.backoff(),
        status_records: args.status_records,
    })
}

fn filter_config(args: &FollowArgs) -> Result<FilterConfig> {
    let events = args
        .events
        .iter()
        .map(|e| e.trim().to_string())
        .filter(|e| !e.is_empty())
        .collect();
    Ok(FilterConfig {
        events,
        conversation_id: args.conversation,
        min_created_at: args.since.as_deref().map(parse_since).transpose()?,
        incoming_only: args.incoming_only,
        include_private: args.include_private,
        inbox_id: args.inbox,
        status: args.status.clone(),
        priority: args.priority.clone(),
        assignee: args.assignee.clone(),
        labels: args.labels.clone(),
    })
}

/// RFC 3339 timestamp or unix seconds.
fn parse_since(value: &str) -> Result<i64> {
    if let Ok(secs) = value.trim().parse::<i64>() {
        return Ok(secs);
    }
    match chrono::DateTime::parse_from_rfc3339(value.trim()) {
        Ok(at) => Ok(at.timestamp()),
        Err(_) => bail!("--since expects RFC 3339 or unix seconds, got {value:?}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser)]
    struct Harness {
        #[command(flatten)]
        args: FollowArgs,
    }

    fn parse(argv: &[&str]) -> FollowArgs {
        Harness::parse_from(std::iter::once("follow").chain(argv.iter().copied())).args
    }

    fn config() -> FileConfig {
        FileConfig {
            base_url: Some("https://desk.example.com".into()),
            account_id: Some(1),
            ..Default::default()
        }
    }

    fn channel() -> ChannelDescriptor {
        ChannelDescriptor {
            channel: "RoomChannel".into(),
            pubsub_token: "t".into(),
            account_id: 1,
            user_id: 2,
        }
    }

    #[test]
    fn since_accepts_both_forms() {
        assert_eq!(parse_since("1700000000").unwrap(), 1_700_000_000);
        assert_eq!(parse_since("2023-11-14T22:13:20Z").unwrap(), 1_700_000_000);
        assert!(parse_since("yesterday").is_err());
    }

    #[test]
    fn filters_from_flags() {
        let args = parse(&[
            "--events",
            "message.created, conversation.status_changed",
            "--assignee",
            "none",
            "--label",
            "vip",
            "--label",
            "billing",
            "--incoming-only",
            "--since",
            "100",
        ]);
        let filter = filter_config(&args).unwrap();
        assert_eq!(filter.events, vec!["message.created", "conversation.status_changed"]);
        assert_eq!(filter.assignee, Some(AssigneeFilter::Unassigned));
        assert_eq!(filter.labels, vec!["vip", "billing"]);
        assert!(filter.incoming_only);
        assert_eq!(filter.min_created_at, Some(100));
        assert!(filter.needs_metadata());
    }

    #[test]
    fn flags_override_config_knobs() {
        let args = parse(&["--debounce-ms", "0", "--max-batch", "5", "--no-presence"]);
        let fc = follow_config(&config(), &args, channel()).unwrap();
        assert!(fc.debounce_window.is_zero());
        assert_eq!(fc.max_batch, 5);
        assert_eq!(fc.presence_interval, None);
        assert_eq!(fc.websocket_url, "wss://desk.example.com/cable");

        let defaults = follow_config(&config(), &parse(&[]), channel()).unwrap();
        assert_eq!(defaults.debounce_window, Duration::from_millis(2000));
        assert_eq!(defaults.presence_interval, Some(Duration::from_secs(20)));
    }

    #[test]
    fn overflow_flag_parses() {
        let args = parse(&["--overflow", "block", "--queue-size", "8"]);
        assert_eq!(args.overflow, Some(OverflowMode::Block));
        assert_eq!(args.queue_size, Some(8));
        assert!(Harness::try_parse_from(["follow", "--overflow", "spill"]).is_err());
    }
}
