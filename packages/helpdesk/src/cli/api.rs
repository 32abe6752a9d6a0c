use std::io::{self, Read, Write};

use anyhow::{Context, Result, bail};
use clap::Args;
use helpdesk_api::{ApiRequest, ApiResponse, HelpdeskClient, Method};
use tokio_util::sync::CancellationToken;

use crate::cli::build_client;
use crate::config::FileConfig;

#[derive(Args)]
pub struct ApiArgs {
    /// HTTP method (GET, POST, PATCH, PUT, DELETE, ...)
    method: String,

    /// Account-relative path (`conversations/42`), `/api/...` path, or full URL
    path: String,

    /// Request body: inline text, `@file`, or `@-` for stdin
    #[arg(short, long)]
    data: Option<String>,

    /// Content type of the request body
    #[arg(long, default_value = "application/json")]
    content_type: String,

    /// Idempotency key, or `auto` to generate one; makes non-GET calls retry-safe
    #[arg(long)]
    idempotency_key: Option<String>,

    /// Poll `202 Accepted` responses at their Location until done
    #[arg(long)]
    wait: bool,

    /// Print status, headers and the rate-limit snapshot to stderr
    #[arg(short, long)]
    include_headers: bool,
}

pub async fn api_command(config: &FileConfig, args: ApiArgs, cancel: CancellationToken) -> Result<()> {
    let mut config = config.clone();
    if args.wait {
        config.wait.enabled = true;
    }
    let client = build_client(&config, &cancel)?;
    let request = build_request(&client, &args)?;

    let response = client
        .execute(&request)
        .await
        .with_context(|| format!("{} {} failed", request.method, request.url))?;

    if args.include_headers {
        print_headers(&client, &response);
    }

    let mut stdout = io::stdout().lock();
    stdout.write_all(&response.body)?;
    if !response.body.is_empty() && !response.body.ends_with(b"\n") {
        stdout.write_all(b"\n")?;
    }
    stdout.flush()?;
    Ok(())
}

fn build_request(client: &HelpdeskClient, args: &ApiArgs) -> Result<ApiRequest> {
    let method = Method::from_bytes(args.method.to_ascii_uppercase().as_bytes())
        .with_context(|| format!("Invalid HTTP method: {}", args.method))?;
    let mut request = ApiRequest::new(method, resolve_url(client, &args.path));

    if let Some(data) = &args.data {
        request = request.with_body(read_body(data)?, args.content_type.clone());
    }
    request = match args.idempotency_key.as_deref() {
        Some("auto") => request.with_generated_idempotency_key(),
        Some("") => bail!("--idempotency-key must not be empty"),
        Some(key) => request.with_idempotency_key(key),
        None => request,
    };
    Ok(request)
}

fn resolve_url(client: &HelpdeskClient, path: &str) -> String {
    if path.starts_with("/api/") {
        format!("{}{}", client.base_url(), path)
    } else {
        client.account_url(path)
    }
}

fn read_body(data: &str) -> Result<Vec<u8>> {
    match data.strip_prefix('@') {
        Some("-") => {
            let mut body = Vec::new();
            io::stdin()
                .read_to_end(&mut body)
                .context("Failed to read request body from stdin")?;
            Ok(body)
        }
        Some(path) => std::fs::read(path).with_context(|| format!("Failed to read request body from {path}")),
        None => Ok(data.as_bytes().to_vec()),
    }
}

fn print_headers(client: &HelpdeskClient, response: &ApiResponse) {
    eprintln!("HTTP {}", response.status);
    for (name, value) in &response.headers {
        eprintln!("{}: {}", name, value.to_str().unwrap_or("<binary>"));
    }
    if let Some(snapshot) = client.executor().rate_limit() {
        eprintln!(
            "rate limit: limit={} remaining={} reset={}",
            fmt_opt(snapshot.limit),
            fmt_opt(snapshot.remaining),
            fmt_opt(snapshot.reset)
        );
    }
}

fn fmt_opt(value: Option<u64>) -> String {
    value.map_or_else(|| "-".to_string(), |v| v.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser)]
    struct Harness {
        #[command(flatten)]
        args: ApiArgs,
    }

    fn client() -> HelpdeskClient {
        let config = FileConfig {
            base_url: Some("https://desk.example.com".into()),
            account_id: Some(2),
            ..Default::default()
        };
        build_client(&config, &CancellationToken::new()).unwrap()
    }

    fn parse(argv: &[&str]) -> ApiArgs {
        Harness::parse_from(std::iter::once("api").chain(argv.iter().copied())).args
    }

    #[test]
    fn url_resolution() {
        let c = client();
        assert_eq!(
            resolve_url(&c, "conversations/1"),
            "https://desk.example.com/api/v1/accounts/2/conversations/1"
        );
        assert_eq!(
            resolve_url(&c, "/api/v1/profile"),
            "https://desk.example.com/api/v1/profile"
        );
        assert_eq!(resolve_url(&c, "https://x.example.com/y"), "https://x.example.com/y");
    }

    #[test]
    fn post_with_auto_idempotency_key_is_retry_safe() {
        let args = parse(&["post", "conversations", "--data", "{}", "--idempotency-key", "auto"]);
        let request = build_request(&client(), &args).unwrap();
        assert_eq!(request.method, Method::POST);
        assert_eq!(request.body.as_deref(), Some(&b"{}"[..]));
        assert_eq!(request.content_type.as_deref(), Some("application/json"));
        assert_eq!(request.idempotency_key.as_ref().map(String::len), Some(36));
        assert!(request.is_idempotent());
    }

    #[test]
    fn post_without_key_is_not_retry_safe() {
        let args = parse(&["POST", "conversations"]);
        let request = build_request(&client(), &args).unwrap();
        assert!(!request.is_idempotent());
        assert!(request.body.is_none());
    }

    #[test]
    fn body_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("body.json");
        std::fs::write(&path, r#"{"content":"hi"}"#).unwrap();
        let body = read_body(&format!("@{}", path.display())).unwrap();
        assert_eq!(body, br#"{"content":"hi"}"#);
        assert!(read_body("@/definitely/not/here").is_err());
    }

    #[test]
    fn invalid_method_is_rejected() {
        let args = parse(&["GE T", "x"]);
        assert!(build_request(&client(), &args).is_err());
    }
}
