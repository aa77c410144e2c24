//! # sanctuary
//!
//! Terminal client for Sanctuary. Follows a stream chat, a prayer chat or
//! the prayer wall live and can post to it from stdin. Runs against a
//! hosted backend, or against an in-process one with `--local`.

mod watch;

use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use sanctuary_backend::StaticActor;
use sanctuary_client::services::{
    embed_url, LiveStreams, PrayerAlerts, PrayerChat, PrayerWall, Profiles, StreamChat,
};
use sanctuary_client::{ClientConfig, ClientContext};
use sanctuary_shared::ActorId;

#[derive(Parser)]
#[command(name = "sanctuary")]
#[command(about = "Sanctuary rooms from the terminal")]
#[command(version)]
struct Cli {
    /// Backend base URL
    #[arg(long, env = "SANCTUARY_URL")]
    url: Option<String>,

    /// Use an in-process backend instead of a server
    #[arg(long)]
    local: bool,

    /// User to act as with --local
    #[arg(long = "as", requires = "local")]
    actor: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Follow a room and print messages as they arrive
    Watch {
        /// Post every line read from stdin
        #[arg(long)]
        send: bool,

        #[command(subcommand)]
        room: Room,
    },
    /// List active live streams
    Streams {
        /// Print the inline mobile player URL
        #[arg(long)]
        mobile: bool,
    },
    /// Print an alert for every new prayer request
    Alerts,
    /// Show a user's profile, prayer requests and testimonies
    Profile {
        /// User ID
        user: String,
    },
}

#[derive(Subcommand)]
enum Room {
    /// Chat of a live stream
    Stream { id: String },
    /// Conversation under a prayer request
    Prayer { id: String },
    /// The prayer wall
    Wall,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Logs go to stderr so stdout carries only room output
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                EnvFilter::new("info,sanctuary_client=debug,sanctuary_realtime=debug")
            }),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let mut config = ClientConfig::from_env();
    if let Some(url) = cli.url {
        config.backend_url = url;
    }
    info!("Starting Sanctuary CLI v{}", env!("CARGO_PKG_VERSION"));

    let ctx = if cli.local {
        let actors = Arc::new(StaticActor::new(cli.actor.as_deref().map(ActorId::from)));
        let (ctx, _, _) = ClientContext::in_memory(actors, config);
        info!("Using in-process backend");
        ctx
    } else {
        ClientContext::connect(config)
            .await
            .context("failed to connect to backend")?
    };

    match cli.command {
        Command::Watch { send, room } => {
            let session = match room {
                Room::Stream { id } => StreamChat::new(ctx.clone()).open(&id).await?,
                Room::Prayer { id } => PrayerChat::new(ctx.clone()).open(&id).await?,
                Room::Wall => PrayerWall::new(ctx.clone()).open().await?,
            };
            watch::follow(session, send).await?;
        }
        Command::Streams { mobile } => {
            let streams = LiveStreams::new(ctx).active().await?;
            if streams.is_empty() {
                println!("No live streams");
            }
            for stream in streams {
                println!("{}\t{}\t{}", stream.id, stream.name, embed_url(&stream.url, mobile));
            }
        }
        Command::Alerts => {
            let alerts = PrayerAlerts::watch(&ctx).await?;
            loop {
                tokio::select! {
                    alert = alerts.next_alert() => match alert {
                        Some(alert) => println!("({} unread) {}", alerts.unread(), alert.text()),
                        None => break,
                    },
                    _ = tokio::signal::ctrl_c() => {
                        info!("Received Ctrl+C, shutting down");
                        break;
                    }
                }
            }
            alerts.stop().await;
        }
        Command::Profile { user } => {
            let user = ActorId::from(user.as_str());
            let profiles = Profiles::new(ctx);

            let profile = profiles.get(&user).await?;
            println!(
                "{} ({})",
                profile.username.as_deref().unwrap_or("unnamed"),
                profile.full_name.as_deref().unwrap_or("-")
            );
            if let Some(bio) = profile.bio.as_deref() {
                println!("{bio}");
            }

            let requests = profiles.prayer_requests_of(&user).await?;
            println!("\nPrayer requests ({})", requests.len());
            for request in requests {
                println!("  {}", request.attribute_str("title").unwrap_or(&request.body));
            }

            let testimonies = profiles.testimonies_of(&user).await?;
            println!("\nTestimonies ({})", testimonies.len());
            for testimony in testimonies {
                println!("  {}", testimony.title);
            }
        }
    }

    Ok(())
}
