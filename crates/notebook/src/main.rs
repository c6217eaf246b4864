//! notebook CLI entry point.
//!
//! Runs notebook documents and single snippets against kernels hosted by a
//! discovered (or launched) Jupyter server.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use log::info;
use notebook::{settings, CoordinatorEvent, NotebookApp};
use notebook_doc::{Document, ExecutionSummary};
use tokio::sync::broadcast;

#[derive(Parser, Debug)]
#[command(name = "notebook")]
#[command(about = "Run Jupyter notebooks against a Jupyter server")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log level
    #[arg(long, global = true, default_value = "info")]
    log_level: String,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Execute every code cell of a notebook and save the outputs
    Run {
        path: PathBuf,

        /// Kernel spec (default: the notebook's kernelspec, then settings)
        #[arg(long)]
        kernel: Option<String>,

        /// Write the executed notebook here instead of over the input
        #[arg(long)]
        output: Option<PathBuf>,
    },

    /// List available kernel specs
    Specs,

    /// List kernels running on the server
    Kernels,

    /// Execute one snippet and print its outputs
    Exec {
        /// Kernel spec (default: settings)
        #[arg(long)]
        kernel: Option<String>,

        code: String,
    },
    /// Show settings, changing and saving any given
    Settings {
        #[arg(long)]
        default_kernel: Option<String>,

        #[arg(long)]
        stop_on_error: Option<bool>,

        #[arg(long)]
        shell_escape_sigil: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&cli.log_level))
        .init();

    if let Commands::Settings {
        default_kernel,
        stop_on_error,
        shell_escape_sigil,
    } = cli.command
    {
        return show_settings(default_kernel, stop_on_error, shell_escape_sigil);
    }

    let mut app = NotebookApp::new(settings::load_settings());
    app.init().await?;

    let result = match cli.command {
        Commands::Run {
            path,
            kernel,
            output,
        } => run_notebook(&mut app, path, kernel, output).await,
        Commands::Specs => list_specs(&app).await,
        Commands::Kernels => list_kernels(&app).await,
        Commands::Exec { kernel, code } => exec(&mut app, kernel, &code).await,
        Commands::Settings { .. } => Ok(()),
    };

    app.teardown().await;
    result
}

fn notebook_kernel_name(document: &Document) -> Option<String> {
    document
        .metadata
        .get("kernelspec")?
        .get("name")?
        .as_str()
        .map(str::to_string)
}

async fn run_notebook(
    app: &mut NotebookApp,
    path: PathBuf,
    kernel: Option<String>,
    output: Option<PathBuf>,
) -> Result<()> {
    let document =
        Document::load(&path).with_context(|| format!("Failed to read {}", path.display()))?;
    let kernel_name = kernel.or_else(|| notebook_kernel_name(&document));
    let session = app.start_kernel(kernel_name.as_deref()).await?;
    session.ready().await?;

    let notebook = app.open_document(document, &session);
    let mut events = notebook.coordinator.subscribe();
    notebook.coordinator.run_all_to_completion().await?;
    notebook.coordinator.close().await?;

    let (mut ran, mut failed, mut cancelled) = (0, 0, 0);
    loop {
        match events.try_recv() {
            Ok(CoordinatorEvent::CellFinished { cell_id, success, .. }) => {
                ran += 1;
                if !success {
                    failed += 1;
                    println!("cell {} failed", cell_id);
                }
            }
            Ok(CoordinatorEvent::CellsCancelled { cell_ids }) => cancelled += cell_ids.len(),
            Ok(_) | Err(broadcast::error::TryRecvError::Lagged(_)) => {}
            Err(_) => break,
        }
    }

    let target = output.unwrap_or(path);
    notebook.document.lock().unwrap().save_as(&target)?;
    info!("[notebook] Wrote {}", target.display());
    println!(
        "{} cell(s) run, {} failed, {} skipped -> {}",
        ran,
        failed,
        cancelled,
        target.display()
    );
    Ok(())
}

async fn list_specs(app: &NotebookApp) -> Result<()> {
    let specs = app.kernel_specs().await?;
    for spec in &specs.specs {
        let marker = if specs.default.as_deref() == Some(spec.name.as_str()) {
            "*"
        } else {
            " "
        };
        println!(
            "{} {:<20} {:<12} {}",
            marker, spec.name, spec.language, spec.display_name
        );
    }
    Ok(())
}

async fn list_kernels(app: &NotebookApp) -> Result<()> {
    let kernels = app.running_kernels().await?;
    if kernels.is_empty() {
        println!("No kernels running");
        return Ok(());
    }
    for kernel in kernels {
        println!(
            "{}  {:<12} {}",
            kernel.id,
            kernel.name,
            kernel.execution_state.as_deref().unwrap_or("unknown")
        );
    }
    Ok(())
}

fn show_settings(
    default_kernel: Option<String>,
    stop_on_error: Option<bool>,
    shell_escape_sigil: Option<String>,
) -> Result<()> {
    let changing =
        default_kernel.is_some() || stop_on_error.is_some() || shell_escape_sigil.is_some();
    let current = if changing {
        settings::update_settings(|s| {
            if let Some(kernel) = default_kernel {
                s.default_kernel = kernel;
            }
            if let Some(stop) = stop_on_error {
                s.stop_on_error = stop;
            }
            if let Some(sigil) = shell_escape_sigil {
                s.shell_escape_sigil = sigil;
            }
        })?
    } else {
        settings::load_settings()
    };
    println!("{}", serde_json::to_string_pretty(&current)?);
    println!("# {}", settings::settings_path().display());
    Ok(())
}

async fn exec(app: &mut NotebookApp, kernel: Option<String>, code: &str) -> Result<()> {
    let session = app.start_kernel(kernel.as_deref()).await?;
    let outputs = session.execute(code).await?.outputs().await;
    let summary = ExecutionSummary::from_outputs(&outputs);

    print!("{}", summary.stdout);
    eprint!("{}", summary.stderr);
    if let Some(text) = summary.result.as_ref().and_then(|r| r.plain()) {
        println!("{}", text);
    }
    if let Some((name, value)) = &summary.error {
        anyhow::bail!("{}: {}", name, value);
    }
    Ok(())
}
