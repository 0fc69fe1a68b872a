//! Command-line surface: run the proxy and manage the stored OAuth login.

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::sync::Arc;

use crate::config::Settings;
use crate::error::AuthError;
use crate::oauth::{OAuthClient, OAuthEndpoints};
use crate::proxy;
use crate::storage::{TokenStatus, TokenStore};

/// Attempts at pasting a code before `login` gives up
pub const MAX_LOGIN_ATTEMPTS: usize = 3;

/// Local OpenAI-compatible proxy for the Anthropic API, authenticated with OAuth
#[derive(Parser, Debug)]
#[command(name = "anthropic-oauth-proxy")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Path to config.toml (defaults to the user config directory)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Force debug logging
    #[arg(long, global = true)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Run the proxy server (default)
    Serve,
    /// Log in through the browser and store tokens
    Login,
    /// Refresh the stored tokens now
    Refresh,
    /// Show whether tokens are stored and when they expire
    Status,
    /// Delete stored tokens
    Logout,
}

pub fn oauth_client(settings: &Settings) -> Result<OAuthClient> {
    OAuthClient::new(
        OAuthEndpoints::from_settings(&settings.oauth),
        TokenStore::new(settings.oauth.token_file.clone()),
        settings.pkce_file(),
    )
    .context("Failed to build OAuth HTTP client")
}

pub async fn run(cli: Cli, settings: Settings) -> Result<()> {
    let oauth = oauth_client(&settings)?;

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => {
            let status = oauth.store().status();
            if !status.present {
                eprintln!("No tokens stored yet. Run `anthropic-oauth-proxy login` first;");
                eprintln!("requests will be answered with 401 until then.");
            }
            proxy::start_server(&settings, Arc::new(oauth)).await
        }
        Command::Login => {
            let stdin = io::stdin();
            login(&oauth, &mut stdin.lock(), true).await
        }
        Command::Refresh => refresh(&oauth).await,
        Command::Status => {
            println!("{}", describe_status(&oauth.store().status()));
            println!("Token file: {}", oauth.store().path().display());
            Ok(())
        }
        Command::Logout => {
            oauth.logout().context("Failed to delete stored tokens")?;
            println!("Logged out.");
            Ok(())
        }
    }
}

/// Interactive PKCE login. Each attempt starts from fresh PKCE material; the
/// loop ends on success, when the user declines another try, or after
/// [`MAX_LOGIN_ATTEMPTS`].
pub async fn login(oauth: &OAuthClient, input: &mut impl BufRead, open_browser: bool) -> Result<()> {
    for attempt in 1..=MAX_LOGIN_ATTEMPTS {
        let (authorize_url, _) = oauth
            .build_authorization_url()
            .context("Failed to start login")?;

        println!("Open this URL in your browser and authorize access:\n");
        println!("  {}\n", authorize_url);
        if open_browser {
            try_open_browser(&authorize_url);
        }

        let code = prompt(input, "Paste the code shown after authorizing (CODE#STATE): ")?;
        match oauth.exchange_code(&code).await {
            Ok(()) => {
                println!("Login successful. Tokens saved to {}", oauth.store().path().display());
                return Ok(());
            }
            Err(e) => {
                eprintln!("Login failed: {}", e);
                oauth.invalidate_pkce();
            }
        }

        if attempt == MAX_LOGIN_ATTEMPTS {
            break;
        }
        let answer = prompt(input, "Try again? [Y/n] ")?;
        if answer.eq_ignore_ascii_case("n") || answer.eq_ignore_ascii_case("no") {
            break;
        }
    }
    bail!("Login did not complete")
}

async fn refresh(oauth: &OAuthClient) -> Result<()> {
    match oauth.try_refresh().await {
        Ok(()) => {
            println!("Tokens refreshed. {}", describe_status(&oauth.store().status()));
            Ok(())
        }
        Err(AuthError::NoTokens) => bail!("No tokens stored; run `login` first"),
        Err(e) if e.is_transient() => Err(e).context("Could not reach the token endpoint"),
        Err(e) => Err(e).context("Refresh rejected; run `login` again"),
    }
}

fn prompt(input: &mut impl BufRead, message: &str) -> Result<String> {
    print!("{}", message);
    io::stdout().flush().ok();
    let mut line = String::new();
    let read = input.read_line(&mut line).context("Failed to read from stdin")?;
    if read == 0 {
        bail!("Input closed");
    }
    Ok(line.trim().to_string())
}

pub fn describe_status(status: &TokenStatus) -> String {
    match (status.present, status.seconds_remaining) {
        (false, _) => "Not logged in.".to_string(),
        (true, Some(remaining)) => format!(
            "Logged in; access token valid for {} (expires at unix {}).",
            format_duration(remaining),
            status.expires_at.unwrap_or_default()
        ),
        (true, None) => "Logged in; access token expired, it will be refreshed on the next request.".to_string(),
    }
}

fn format_duration(secs: i64) -> String {
    let secs = secs.max(0);
    let (hours, minutes, seconds) = (secs / 3600, (secs % 3600) / 60, secs % 60);
    if hours > 0 {
        format!("{}h {}m", hours, minutes)
    } else if minutes > 0 {
        format!("{}m {}s", minutes, seconds)
    } else {
        format!("{}s", seconds)
    }
}

fn try_open_browser(url: &str) {
    if cfg!(target_os = "windows") {
        let _ = std::process::Command::new("cmd")
            .args(["/C", "start", "", url])
            .spawn();
        return;
    }

    let opener = if cfg!(target_os = "macos") {
        "open"
    } else {
        "xdg-open"
    };

    let _ = std::process::Command::new(opener).arg(url).spawn();
}
