//! Accounts command - add, list and remove tado accounts.

use anyhow::{Context as _, Result, bail};
use clap::{Args, Subcommand};
use tado_proxy_auth::AccountLoader;

use super::{Context, format_time, seed_clients};

#[derive(Args, Debug)]
pub struct AccountsArgs {
    #[command(subcommand)]
    pub command: AccountsCommand,
}

#[derive(Subcommand, Debug)]
pub enum AccountsCommand {
    /// Add an account and authorize it against every passwordGrant client
    Add {
        /// Account email
        email: String,

        /// Account password (prompted when omitted)
        #[arg(long, env = "TADO_PROXY_PASSWORD", hide_env_values = true)]
        password: Option<String>,
    },

    /// List accounts
    List,

    /// Remove an account with its tokens
    Remove {
        /// Account id
        id: String,
    },
}

pub async fn run(args: AccountsArgs, ctx: &Context) -> Result<()> {
    match args.command {
        AccountsCommand::Add { email, password } => add(ctx, email, password).await,
        AccountsCommand::List => list(ctx),
        AccountsCommand::Remove { id } => remove(ctx, &id),
    }
}

async fn add(ctx: &Context, email: String, password: Option<String>) -> Result<()> {
    let email = email.trim().to_string();
    if email.is_empty() {
        bail!("Email must not be empty");
    }
    let password = match password {
        Some(password) => password,
        None => rpassword::prompt_password(format!("Password for {email}: "))
            .context("Failed to read password")?,
    };
    if password.is_empty() {
        bail!("Password must not be empty");
    }

    let store = ctx.open_store(None)?;
    seed_clients(&store, &ctx.config)?;

    let oauth = ctx.oauth(ctx.http_clients()?);
    let loader = AccountLoader::new(store.clone(), oauth.clone(), oauth);
    let account = loader
        .create_and_load(&email, &password)
        .await
        .with_context(|| format!("Failed to add account {email}"))?;

    let homes = store.list_account_homes(&account.id)?;
    println!("Added account {} ({})", account.email, account.id);
    for home in homes {
        println!("  home {} {}", home.tado_id, home.name);
    }
    Ok(())
}

fn list(ctx: &Context) -> Result<()> {
    let store = ctx.open_store(None)?;
    let accounts = store.list_accounts()?;
    if accounts.is_empty() {
        println!("No accounts");
        return Ok(());
    }

    println!("{:<36}  {:<32}  {:<10}  CREATED", "ID", "EMAIL", "TADO ID");
    for account in accounts {
        println!(
            "{:<36}  {:<32}  {:<10}  {}",
            account.id,
            account.email,
            account.tado_id.as_deref().unwrap_or("-"),
            format_time(Some(account.created_at))
        );
    }
    Ok(())
}

fn remove(ctx: &Context, id: &str) -> Result<()> {
    let store = ctx.open_store(None)?;
    store
        .delete_account(id)
        .with_context(|| format!("Failed to remove account {id}"))?;
    println!("Removed account {id}");
    Ok(())
}
