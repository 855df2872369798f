//! Tokens command - shows stored tokens and their quota usage.

use std::collections::HashMap;

use anyhow::Result;
use clap::{Args, Subcommand};
use tado_proxy_auth::ratelimit::ratelimit_cutoff;
use tado_proxy_store::TokenFilter;

use super::{Context, format_time};

#[derive(Args, Debug)]
pub struct TokensArgs {
    #[command(subcommand)]
    pub command: TokensCommand,
}

#[derive(Subcommand, Debug)]
pub enum TokensCommand {
    /// List tokens with usage since the last quota reset
    List,
}

pub async fn run(args: TokensArgs, ctx: &Context) -> Result<()> {
    match args.command {
        TokensCommand::List => list(ctx),
    }
}

fn list(ctx: &Context) -> Result<()> {
    let store = ctx.open_store(None)?;
    let tokens = store.list_tokens(&TokenFilter::default())?;
    if tokens.is_empty() {
        println!("No tokens");
        return Ok(());
    }

    let accounts: HashMap<_, _> = store
        .list_accounts()?
        .into_iter()
        .map(|a| (a.id, a.email))
        .collect();
    let clients: HashMap<_, _> = store
        .list_clients(None)?
        .into_iter()
        .map(|c| (c.id.clone(), c))
        .collect();
    let cutoff = ratelimit_cutoff();

    println!(
        "{:<36}  {:<28}  {:<20}  {:<7}  {:<19}  {:<19}  {:<8}  USAGE",
        "ID", "ACCOUNT", "CLIENT", "STATUS", "EXPIRES", "USED", "DISABLED"
    );
    for token in tokens {
        let used = store.count_requests(&token.id, cutoff)?;
        let (client_name, limit) = clients
            .get(&token.client)
            .map(|c| (c.name.as_str(), c.daily_limit))
            .unwrap_or(("-", 0));
        println!(
            "{:<36}  {:<28}  {:<20}  {:<7}  {:<19}  {:<19}  {:<8}  {}/{}",
            token.id,
            accounts.get(&token.account).map(String::as_str).unwrap_or("-"),
            client_name,
            token.status,
            format_time(Some(token.expires)),
            format_time(token.used),
            token.disabled,
            used,
            limit
        );
    }

    if ctx.verbose {
        println!("Usage counted since {}", format_time(Some(cutoff)));
    }
    Ok(())
}
