use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use crate::app::model::ExportOverrides;

#[derive(Debug, Parser)]
#[command(author, version, about)]
pub struct Cli {
    /// YAML config file (default: `SERIALBOOK_CONFIG`, else built-in defaults).
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Discover a fiction and record its metadata and chapter index.
    Ingest(IngestArgs),
    /// Download bodies for chapters that have none yet.
    Fill(FillArgs),
    /// Re-download one chapter, bypassing the page cache.
    Refetch(RefetchArgs),
    /// Assemble a stored book into an EPUB.
    Export(ExportArgs),
    /// List stored books.
    Books,
    Tasks {
        #[command(subcommand)]
        command: TasksCommand,
    },
}

#[derive(Debug, Args)]
pub struct IngestArgs {
    /// Fiction page URL.
    #[arg(long)]
    pub url: String,

    /// Re-download the fiction page instead of using the cached copy.
    #[arg(long)]
    pub refresh: bool,
}

#[derive(Debug, Args)]
pub struct FillArgs {
    #[arg(long)]
    pub book_id: u64,

    /// Maximum chapters to fill in this run.
    #[arg(long)]
    pub limit: Option<usize>,
}

#[derive(Debug, Args)]
pub struct RefetchArgs {
    #[arg(long)]
    pub chapter_id: u64,
}

#[derive(Debug, Args)]
pub struct ExportArgs {
    #[arg(long)]
    pub book_id: u64,

    /// Output EPUB path (default: `{output_dir}/{provider}-{uid}.epub`).
    #[arg(long)]
    pub out: Option<PathBuf>,

    #[command(flatten)]
    pub options: ExportOptionArgs,
}

#[derive(Debug, Args)]
pub struct ExportOptionArgs {
    /// Book title (default: stored title).
    #[arg(long)]
    pub title: Option<String>,

    /// Author (default: stored author).
    #[arg(long)]
    pub author: Option<String>,

    /// Language tag (default: stored language).
    #[arg(long)]
    pub language: Option<String>,

    /// Cover image URL or local path (default: stored cover).
    #[arg(long)]
    pub cover: Option<String>,

    /// Stylesheet replacing the built-in CSS.
    #[arg(long)]
    pub css: Option<PathBuf>,

    /// Strip every image from the chapter bodies.
    #[arg(long)]
    pub no_images: bool,

    /// Prepend each chapter title as a heading.
    #[arg(long)]
    pub chapter_titles: bool,

    /// Maximum image width in pixels.
    #[arg(long, value_parser = clap::value_parser!(u32).range(1..))]
    pub max_width: Option<u32>,

    /// Maximum image height in pixels.
    #[arg(long, value_parser = clap::value_parser!(u32).range(1..))]
    pub max_height: Option<u32>,
}

impl ExportOptionArgs {
    pub fn to_overrides(&self) -> ExportOverrides {
        ExportOverrides {
            title: self.title.clone(),
            author: self.author.clone(),
            language: self.language.clone(),
            cover: self.cover.clone(),
            include_images: self.no_images.then_some(false),
            include_chapter_titles: self.chapter_titles.then_some(true),
            max_width: self.max_width,
            max_height: self.max_height,
            stylesheet: self.css.clone(),
        }
    }
}

#[derive(Debug, Subcommand)]
pub enum TasksCommand {
    /// Queue an export task.
    SubmitExport(SubmitExportArgs),
    /// Run every queued task through the bounded in-process queue.
    Run,
    /// List recorded tasks.
    List,
    /// Delete finished tasks past their retention.
    Cleanup,
}

#[derive(Debug, Args)]
pub struct SubmitExportArgs {
    #[arg(long)]
    pub book_id: u64,

    #[command(flatten)]
    pub options: ExportOptionArgs,
}
