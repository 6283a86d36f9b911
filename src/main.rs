use clap::{Parser, Subcommand};
use std::error::Error;
use std::path::PathBuf;
use wallhaven_viewer::backend::cache::EvictionPolicy;
use wallhaven_viewer::backend::events::{ErrorContext, Event, EventReceiver};
use wallhaven_viewer::backend::wallhaven::{CatalogClient, Category};
use wallhaven_viewer::{Config, Viewer};

#[derive(Parser)]
#[command(name = "wallhaven-viewer", version, about = "Browse and download wallhaven pictures")]
struct Cli {
    /// Config file to use instead of the default location
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[arg(long, value_enum, global = true)]
    cache_policy: Option<EvictionPolicy>,
    #[arg(long, global = true)]
    download_dir: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Lists one page of a category and fetches its thumbnails
    List {
        #[arg(value_enum)]
        category: Category,
        #[arg(long, default_value_t = 1)]
        page: u32,
        /// Write the thumbnails into this directory
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Streams a full-size picture, reporting progress
    Preview {
        id: String,
        /// Save the picture to the download directory once loaded
        #[arg(long)]
        save: bool,
    },
    /// Downloads a picture with parallel byte ranges
    Download { id: String },
    /// Prints the origin URL and resolution of a picture
    Info { id: String },
    /// Opens the picture page in the system browser
    Open { id: String },
}

enum Flow {
    Continue,
    Done,
}

/// Feeds events to `on_event` until it says done. Returns false on Ctrl-C.
async fn drive(rx: &mut EventReceiver, mut on_event: impl FnMut(Event) -> Flow) -> bool {
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    loop {
        tokio::select! {
            biased;
            _ = &mut ctrl_c => return false,
            event = rx.recv() => match event {
                Some(event) => {
                    if let Flow::Done = on_event(event) {
                        return true;
                    }
                }
                None => return true,
            },
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load(),
    };
    if let Some(policy) = cli.cache_policy {
        config.cache.policy = policy;
    }
    if let Some(dir) = cli.download_dir {
        config.download_dir = dir;
    }

    let (viewer, mut rx) = Viewer::connect(&config)?;
    match cli.command {
        Command::List {
            category,
            page,
            out,
        } => list(&viewer, &mut rx, category, page, out).await,
        Command::Preview { id, save } => preview(&viewer, &mut rx, &id, save, &config).await,
        Command::Download { id } => {
            let token = viewer.download(&id, config.download_dir.clone());
            let mut failed = None;
            let finished = drive(&mut rx, |event| match event {
                Event::Saved { path, .. } => {
                    println!("saved {}", path.display());
                    Flow::Done
                }
                Event::Error { message, .. } => {
                    failed = Some(message);
                    Flow::Done
                }
                _ => Flow::Continue,
            })
            .await;
            if !finished {
                token.cancel();
                return Err("download interrupted".into());
            }
            match failed {
                Some(message) => Err(message.into()),
                None => Ok(()),
            }
        }
        Command::Info { id } => {
            let picture = viewer.picture_info(&id).await?;
            println!("id:         {}", picture.id);
            println!("origin:     {}", picture.origin_url);
            println!("resolution: {}", picture.resolution);
            println!("file:       {}", picture.file_name());
            Ok(())
        }
        Command::Open { id } => {
            let url = viewer.source().page_url(&id);
            webbrowser::open(&url)?;
            println!("opened {}", url);
            Ok(())
        }
    }
}

async fn list(
    viewer: &Viewer<CatalogClient>,
    rx: &mut EventReceiver,
    category: Category,
    page: u32,
    out: Option<PathBuf>,
) -> Result<(), Box<dyn Error>> {
    let generation = viewer.list_page(category, page);
    let mut thumbnails = Vec::new();
    let finished = drive(rx, |event| match event {
        Event::GridCleared { page, .. } => {
            println!("{} page {}", category, page);
            Flow::Continue
        }
        Event::Thumbnail {
            picture_id,
            index,
            bytes,
            cached,
            ..
        } => {
            let origin = if cached { "cache" } else { "network" };
            println!("{:>3}  {:<10} {:>8} bytes ({})", index, picture_id, bytes.len(), origin);
            thumbnails.push((picture_id, bytes));
            Flow::Continue
        }
        Event::Error { context, message, .. } => {
            eprintln!("{:?}: {}", context, message);
            match context {
                ErrorContext::Listing { .. } => Flow::Done,
                _ => Flow::Continue,
            }
        }
        Event::GridFinished {
            generation: g,
            listed,
            ..
        } if g == generation => {
            if listed == 0 {
                println!("no pictures on this page");
            }
            Flow::Done
        }
        _ => Flow::Continue,
    })
    .await;
    if !finished {
        viewer.stop_grid(category);
        return Ok(());
    }

    if let Some(dir) = out {
        tokio::fs::create_dir_all(&dir).await?;
        for (id, bytes) in &thumbnails {
            tokio::fs::write(dir.join(format!("th-{}.jpg", id)), bytes).await?;
        }
        println!("wrote {} thumbnails to {}", thumbnails.len(), dir.display());
    }
    Ok(())
}

async fn preview(
    viewer: &Viewer<CatalogClient>,
    rx: &mut EventReceiver,
    id: &str,
    save: bool,
    config: &Config,
) -> Result<(), Box<dyn Error>> {
    viewer.load_preview(id);
    let mut failed = None;
    let finished = drive(rx, |event| match event {
        Event::PreviewStarted { total_size, .. } => {
            println!("loading {} ({} bytes)", id, total_size);
            Flow::Continue
        }
        Event::PreviewProgress {
            progress, image, ..
        } => {
            match image {
                Some(image) => println!(
                    "{:5.1}%  decoded {}x{}",
                    progress.percent(),
                    image.width(),
                    image.height()
                ),
                None => println!("{:5.1}%", progress.percent()),
            }
            Flow::Continue
        }
        Event::PreviewComplete { .. } if save => {
            viewer.save_preview(config.download_dir.clone());
            Flow::Continue
        }
        Event::PreviewComplete { .. } => Flow::Done,
        Event::Saved { path, .. } => {
            println!("saved {}", path.display());
            Flow::Done
        }
        Event::Error { message, .. } => {
            failed = Some(message);
            Flow::Done
        }
        _ => Flow::Continue,
    })
    .await;
    if !finished {
        viewer.cancel_preview();
        return Err("preview interrupted".into());
    }
    match failed {
        Some(message) => Err(message.into()),
        None => Ok(()),
    }
}
