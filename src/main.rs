use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use clap::{Args, Parser, Subcommand};
use tracing::{info, warn};

use pdf_layout_translator::pipeline::{
    self, INTERMEDIATE_FILE, OUTPUT_FILE, RENDER_LOG_FILE, TRANSLATED_FILE,
};
use pdf_layout_translator::{
    CoverageReport, Settings, TranslatorConfig, compare_files, load_settings, resolve_key,
    resolve_provider_selection,
};

#[derive(Parser, Debug)]
#[command(
    name = "pdf-layout-translator",
    version,
    about = "Translate PDF documents while keeping their layout"
)]
struct Cli {
    /// Read extra settings from a local TOML file
    #[arg(short = 'r', long = "read-settings", global = true)]
    read_settings: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(long = "verbose", global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Extract classified text blocks into an intermediate JSON document
    Extract {
        input: PathBuf,

        #[arg(short = 'o', long = "output", default_value = INTERMEDIATE_FILE)]
        output: PathBuf,
    },

    /// Translate the blocks of an intermediate document page by page
    Translate {
        input: PathBuf,

        #[arg(short = 'o', long = "output", default_value = TRANSLATED_FILE)]
        output: PathBuf,

        #[command(flatten)]
        translation: TranslationArgs,
    },

    /// Draw a translated document over the source PDF
    Render {
        source: PathBuf,

        translated: PathBuf,

        #[arg(short = 'o', long = "output", default_value = OUTPUT_FILE)]
        output: PathBuf,

        #[arg(long = "log", default_value = RENDER_LOG_FILE)]
        log: PathBuf,
    },

    /// Check that every extracted text block was rendered
    Validate {
        intermediate: PathBuf,

        render_log: PathBuf,

        /// Minimum fitted ratio (default from settings [validation])
        #[arg(long = "threshold")]
        threshold: Option<f64>,
    },

    /// Compare the text blocks of two rendered PDFs page by page
    Compare {
        first: PathBuf,

        second: PathBuf,

        /// Also write the JSON report to this file
        #[arg(short = 'o', long = "output")]
        output: Option<PathBuf>,
    },

    /// Run all four stages, writing every artifact into the work directory
    Run {
        input: PathBuf,

        #[arg(long = "workdir", default_value = ".")]
        workdir: PathBuf,

        #[command(flatten)]
        translation: TranslationArgs,
    },
}

#[derive(Args, Debug, Clone)]
struct TranslationArgs {
    /// Target language code (default from settings [translation])
    #[arg(short = 'l', long = "lang")]
    lang: Option<String>,

    /// Register key from settings [formally]
    #[arg(short = 'f', long = "formal")]
    formal: Option<String>,

    /// Provider or provider:model (e.g. openai:MODEL_ID)
    #[arg(short = 'm', long = "model")]
    model: Option<String>,

    /// API key (overrides environment variables)
    #[arg(short = 'k', long = "key")]
    key: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    pdf_layout_translator::logging::init(cli.verbose)?;
    let settings = load_settings(cli.read_settings.as_deref())?;

    match cli.command {
        Command::Extract { input, output } => {
            let document = pipeline::extract_stage(&input, &output, &settings)?;
            info!(
                "extracted {} blocks from {} pages",
                document.blocks().count(),
                document.pages.len()
            );
        }
        Command::Translate {
            input,
            output,
            translation,
        } => {
            let config = translator_config(&translation, &settings)?;
            let outcome = pipeline::translate_stage(&input, &output, config, &settings).await?;
            info!("translation {}", outcome.status.as_str());
            if !outcome.failed_pages.is_empty() {
                warn!("pages left untranslated: {:?}", outcome.failed_pages);
            }
        }
        Command::Render {
            source,
            translated,
            output,
            log,
        } => {
            let render_log =
                pipeline::render_stage(&source, &translated, &output, &log, &settings.render)?;
            info!(
                "rendered {} blocks, {} forced at the floor size",
                render_log.rendered_blocks.len(),
                render_log.failed_blocks.len()
            );
        }
        Command::Validate {
            intermediate,
            render_log,
            threshold,
        } => {
            let threshold = threshold.unwrap_or(settings.validation.coverage_threshold);
            let report = pipeline::validate_stage(&intermediate, &render_log, threshold)?;
            finish_with_report(&report)?;
        }
        Command::Compare {
            first,
            second,
            output,
        } => {
            let report = compare_files(&first, &second)?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            if let Some(output) = output {
                pipeline::write_report(&output, &report)?;
                info!("comparison written to {}", output.display());
            }
        }
        Command::Run {
            input,
            workdir,
            translation,
        } => {
            std::fs::create_dir_all(&workdir)
                .with_context(|| format!("failed to create {}", workdir.display()))?;
            let config = translator_config(&translation, &settings)?;
            let summary = pipeline::run_all(&input, &workdir, config, &settings).await?;
            if !summary.failed_pages.is_empty() {
                warn!("pages left untranslated: {:?}", summary.failed_pages);
            }
            info!("output written to {}", summary.paths.output.display());
            finish_with_report(&summary.report)?;
        }
    }
    Ok(())
}

/// Flags win over settings; the key comes from `--key` or the environment.
fn translator_config(args: &TranslationArgs, settings: &Settings) -> Result<TranslatorConfig> {
    let translation = &settings.translation;
    let selection =
        resolve_provider_selection(args.model.as_deref(), translation.provider.as_deref())?;
    let model = selection
        .requested_model
        .or_else(|| {
            args.model
                .is_none()
                .then(|| translation.model.clone())
                .flatten()
        })
        .unwrap_or_else(|| selection.provider.default_model().to_string());
    let key = resolve_key(selection.provider, args.key.as_deref())?;
    let formality = args
        .formal
        .clone()
        .unwrap_or_else(|| translation.formality.clone());
    if formality.trim().is_empty() {
        return Err(anyhow!("formality is empty"));
    }

    Ok(TranslatorConfig {
        provider: selection.provider,
        key,
        model,
        base_url: translation.base_url.clone(),
        lang: args.lang.clone().unwrap_or_else(|| translation.lang.clone()),
        formality,
        retry: translation.retry_policy(),
        page_delay: Duration::from_millis(translation.page_delay_ms),
        timeout: Duration::from_secs(translation.timeout_secs),
    })
}

fn finish_with_report(report: &CoverageReport) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(report)?);
    if report.passed {
        Ok(())
    } else {
        Err(anyhow!(
            "coverage check failed: {:.1}% fitted, {} blocks missing",
            report.coverage * 100.0,
            report.missing
        ))
    }
}
