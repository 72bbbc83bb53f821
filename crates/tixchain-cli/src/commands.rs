//! Command parsing and execution.

use std::io::{self, Write};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tracing::{debug, warn};

use tixchain_core::{
    ApiError, Config, ProfileUpdate, RestoreFailure, RestoreOutcome, SessionError, SessionStore,
    User,
};

pub const ENV_EMAIL: &str = "TIXCHAIN_EMAIL";
pub const ENV_PASSWORD: &str = "TIXCHAIN_PASSWORD";

pub const USAGE: &str = "\
Usage: tixchain <command> [args]

Commands:
  status                        Restore the saved session and show its state
  whoami                        Print the signed-in profile as JSON
  login [email]                 Sign in (password is prompted)
  register <name> <email>       Create an account and sign in
  logout                        Forget the saved session
  update-profile [--field value]...
                                Change profile fields: --name, --username,
                                --full-name, --wallet-address, --bio, --avatar-url
  help                          Show this message

Environment:
  TIXCHAIN_API_URL              Backend base URL (default http://localhost:5000/api)
  TIXCHAIN_STORAGE              keyring | file | encrypted-file | memory
  TIXCHAIN_STORE_PASSPHRASE     Passphrase for the encrypted-file store
  TIXCHAIN_EMAIL, TIXCHAIN_PASSWORD
                                Non-interactive login
  RUST_LOG                      Log filter (default warn)";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Status,
    Whoami,
    Login { email: Option<String> },
    Register { name: String, email: String },
    Logout,
    UpdateProfile(ProfileUpdate),
    Help,
}

impl Command {
    pub fn parse(args: &[String]) -> Result<Self> {
        let Some((name, rest)) = args.split_first() else {
            return Ok(Command::Help);
        };

        let command = match name.as_str() {
            "status" => Command::Status,
            "whoami" => Command::Whoami,
            "login" => match rest {
                [] => Command::Login { email: None },
                [email] => Command::Login {
                    email: Some(email.clone()),
                },
                _ => bail!("login takes at most one argument"),
            },
            "register" => match rest {
                [name, email] => Command::Register {
                    name: name.clone(),
                    email: email.clone(),
                },
                _ => bail!("register needs <name> <email>"),
            },
            "logout" => Command::Logout,
            "update-profile" => Command::UpdateProfile(parse_profile_flags(rest)?),
            "help" | "-h" | "--help" => Command::Help,
            other => bail!("Unknown command: {}", other),
        };

        let takes_no_args = matches!(
            command,
            Command::Status | Command::Whoami | Command::Logout
        );
        if takes_no_args && !rest.is_empty() {
            bail!("{} takes no arguments", name);
        }
        Ok(command)
    }
}

fn parse_profile_flags(args: &[String]) -> Result<ProfileUpdate> {
    let mut update = ProfileUpdate::default();
    let mut iter = args.iter();

    while let Some(flag) = iter.next() {
        let value = iter
            .next()
            .with_context(|| format!("{} needs a value", flag))?
            .clone();
        let slot = match flag.as_str() {
            "--name" => &mut update.name,
            "--username" => &mut update.username,
            "--full-name" => &mut update.full_name,
            "--wallet-address" => &mut update.wallet_address,
            "--bio" => &mut update.bio,
            "--avatar-url" => &mut update.avatar_url,
            other => bail!("Unknown profile field: {}", other),
        };
        *slot = Some(value);
    }

    if update.is_empty() {
        bail!("update-profile needs at least one --field value pair");
    }
    Ok(update)
}

pub async fn run(command: Command, mut config: Config) -> Result<()> {
    let api = Arc::new(config.api_client()?);
    let storage = config.open_token_store()?;
    let session = SessionStore::new(api, storage);
    debug!(api = %config.api_base_url, storage = ?config.storage, "Session store ready");

    match command {
        Command::Help => println!("{}", USAGE),

        Command::Status => {
            let outcome = session.initialize().await;
            let snapshot = session.snapshot();
            println!("Status: {}", snapshot.status());
            if let Some(user) = snapshot.identity() {
                println!("User:   {} <{}>", user.display_name(), user.email);
            }
            if let RestoreOutcome::Failed(reason) = outcome {
                println!("Note:   {}", restore_note(reason));
            }
        }

        Command::Whoami => {
            session.initialize().await;
            let Some(user) = session.identity() else {
                bail!("Not logged in");
            };
            println!("{}", serde_json::to_string_pretty(&user)?);
        }

        Command::Login { email } => {
            let email = match email
                .or_else(|| std::env::var(ENV_EMAIL).ok())
                .or_else(|| config.last_email.clone())
            {
                Some(email) => email,
                None => prompt_line("Email: ")?,
            };
            let password = match std::env::var(ENV_PASSWORD) {
                Ok(password) => password,
                Err(_) => rpassword::prompt_password("Password: ")?,
            };
            if email.is_empty() || password.is_empty() {
                bail!("Email and password required");
            }

            let user = session
                .login(&email, &password)
                .await
                .map_err(|e| anyhow::anyhow!(describe_error(&e)))?;
            remember_email(&mut config, email);
            println!("{}", welcome(&user));
        }

        Command::Register { name, email } => {
            let password = rpassword::prompt_password("Choose a password: ")?;
            let confirm = rpassword::prompt_password("Repeat password: ")?;
            if password.is_empty() {
                bail!("Password must not be empty");
            }
            if password != confirm {
                bail!("Passwords do not match");
            }

            let user = session
                .register(&name, &email, &password)
                .await
                .map_err(|e| anyhow::anyhow!(describe_error(&e)))?;
            remember_email(&mut config, email);
            println!("{}", welcome(&user));
        }

        Command::Logout => {
            session.logout().await;
            println!("Logged out");
        }

        Command::UpdateProfile(update) => {
            session.initialize().await;
            let user = session
                .update_profile(&update)
                .await
                .map_err(|e| anyhow::anyhow!(describe_error(&e)))?;
            println!("{}", serde_json::to_string_pretty(&user)?);
        }
    }

    Ok(())
}

fn prompt_line(prompt: &str) -> Result<String> {
    print!("{}", prompt);
    io::stdout().flush()?;

    let mut line = String::new();
    io::stdin().read_line(&mut line)?;
    Ok(line.trim().to_string())
}

fn remember_email(config: &mut Config, email: String) {
    config.last_email = Some(email);
    if let Err(e) = config.save() {
        warn!(error = %e, "Failed to save config");
    }
}

fn welcome(user: &User) -> String {
    let mut line = format!("Signed in as {} <{}>", user.display_name(), user.email);
    if let Some(ref wallet) = user.wallet_address {
        line.push_str(&format!(" (wallet {})", wallet));
    }
    line
}

fn restore_note(reason: RestoreFailure) -> &'static str {
    match reason {
        RestoreFailure::Expired => "saved session expired, please log in again",
        RestoreFailure::Unreachable => "could not reach the server, saved session discarded",
        RestoreFailure::Malformed => "server sent an unexpected response, saved session discarded",
        RestoreFailure::Other => "saved session could not be restored",
    }
}

/// User-facing message for a failed session operation.
fn describe_error(err: &SessionError) -> String {
    match err {
        SessionError::Api(ApiError::Unauthorized) => {
            "Invalid credentials or expired session. Please log in again.".to_string()
        }
        SessionError::Api(ApiError::Conflict(_)) => {
            "An account with that email already exists".to_string()
        }
        SessionError::Api(e) if e.is_timeout() => {
            "Connection timed out. Please try again.".to_string()
        }
        SessionError::Api(e) if e.is_transport() => {
            "Unable to connect to server. Check that the backend is running.".to_string()
        }
        SessionError::NotAuthenticated => "Not logged in. Run `tixchain login` first.".to_string(),
        SessionError::Storage(e) => format!(
            "The server accepted the sign-in, but the session could not be saved ({}). Check the storage setting.",
            e
        ),
        other => other.to_string(),
    }
}
