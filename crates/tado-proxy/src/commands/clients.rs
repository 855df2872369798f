//! Clients command - lists registered OAuth clients.

use anyhow::Result;
use clap::{Args, Subcommand};

use super::Context;

#[derive(Args, Debug)]
pub struct ClientsArgs {
    #[command(subcommand)]
    pub command: ClientsCommand,
}

#[derive(Subcommand, Debug)]
pub enum ClientsCommand {
    /// List stored clients
    List,
}

pub async fn run(args: ClientsArgs, ctx: &Context) -> Result<()> {
    match args.command {
        ClientsCommand::List => list(ctx),
    }
}

fn list(ctx: &Context) -> Result<()> {
    let store = ctx.open_store(None)?;
    let clients = store.list_clients(None)?;
    if clients.is_empty() {
        println!("No clients. Run `tado-proxy serve` once to seed them.");
        return Ok(());
    }

    println!(
        "{:<36}  {:<24}  {:<13}  {:<8}  {:>8}  DISABLED",
        "ID", "NAME", "TYPE", "PLATFORM", "LIMIT"
    );
    for client in clients {
        println!(
            "{:<36}  {:<24}  {:<13}  {:<8}  {:>8}  {}",
            client.id,
            client.name,
            client.client_type,
            client.platform,
            client.daily_limit,
            client.disabled
        );
    }
    Ok(())
}
