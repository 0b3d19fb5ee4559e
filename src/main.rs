use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context as _;
use clap::Parser as _;
use url::Url;

use serialbook::app::Services;
use serialbook::app::cleanup::cleanup_expired_tasks;
use serialbook::app::model::TaskKind;
use serialbook::app::queue::InProcessQueue;
use serialbook::app::runner::TaskRunner;
use serialbook::app::task_store::{LocalFsTaskStore, TaskStore as _};
use serialbook::cli::{Cli, Command, TasksCommand};
use serialbook::config::AppConfig;
use serialbook::fetch::FetchOptions;
use serialbook::store::ChapterFilter;

fn main() -> ExitCode {
    if let Err(err) = try_main() {
        eprintln!("{err:#}");
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}

fn try_main() -> anyhow::Result<()> {
    serialbook::logging::init().context("init logging")?;

    let cli = Cli::parse();
    tracing::debug!(?cli, "parsed cli");

    let config = AppConfig::load(cli.config.as_deref()).context("load config")?;
    let services = Services::from_config(config).context("wire services")?;
    let Services {
        config,
        library,
        fetcher,
        registry,
    } = &services;

    match cli.command {
        Command::Ingest(args) => {
            let url = Url::parse(&args.url).with_context(|| format!("parse url: {}", args.url))?;
            let provider = registry.for_url(&url).context("select provider")?;
            let options = FetchOptions {
                ignore_cache: args.refresh,
            };
            let report =
                serialbook::ingest::ingest_fiction(library.as_ref(), fetcher, provider, &url, &options)
                    .context("ingest")?;
            println!(
                "book {} \"{}\": {} chapters added, {} updated, {} rejected",
                report.book.id,
                report.book.title,
                report.index.inserted,
                report.index.updated,
                report.index.rejected
            );
        }
        Command::Fill(args) => {
            let filled = serialbook::fill::fill_missing_content(
                library.as_ref(),
                fetcher,
                registry,
                args.book_id,
                args.limit,
            )
            .context("fill")?;
            println!("filled {filled} chapters");
        }
        Command::Refetch(args) => {
            serialbook::fill::refetch_chapter(library.as_ref(), fetcher, registry, args.chapter_id)
                .context("refetch")?;
            println!("chapter {} re-fetched", args.chapter_id);
        }
        Command::Export(args) => {
            let settings = args
                .options
                .to_overrides()
                .to_settings(config)
                .context("export options")?;
            let book = library.get_book(args.book_id).context("load book")?;
            let out = args
                .out
                .unwrap_or_else(|| serialbook::export::default_output_path(&config.output_dir, &book));
            let report = serialbook::export::export_book(
                library.as_ref(),
                fetcher,
                registry,
                args.book_id,
                &settings,
                &out,
            )
            .context("export")?;
            println!(
                "wrote {} ({} chapters, {} images, {} images dropped)",
                out.display(),
                report.chapters,
                report.images_packaged,
                report.images_dropped
            );
        }
        Command::Books => {
            for book in library.list_books().context("list books")? {
                let total = library.count_chapters(book.id, ChapterFilter::All)?;
                let fetched = library.count_chapters(book.id, ChapterFilter::Fetched)?;
                println!(
                    "{}\t{}\t{}\t{}\t{fetched}/{total}",
                    book.id, book.provider, book.fiction_uid, book.title
                );
            }
        }
        Command::Tasks { command } => {
            let task_store = Arc::new(LocalFsTaskStore::new(config.tasks_dir()));
            run_tasks_command(command, task_store, services.clone())?;
        }
    }

    Ok(())
}

fn run_tasks_command(
    command: TasksCommand,
    task_store: Arc<LocalFsTaskStore>,
    services: Services,
) -> anyhow::Result<()> {
    let config = Arc::clone(&services.config);
    match command {
        TasksCommand::SubmitExport(args) => {
            let runner = TaskRunner::new(task_store, services);
            let task = runner.submit(TaskKind::Export {
                book_id: args.book_id,
                overrides: args.options.to_overrides(),
            })?;
            println!("{}", task.task_id);
        }
        TasksCommand::Run => {
            let runner = Arc::new(TaskRunner::new(task_store.clone(), services));
            let queued = runner.queued_task_ids()?;
            let queue = InProcessQueue::new(config.worker_concurrency);
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()
                .context("build tokio runtime")?;
            let ran = runtime.block_on(queue.run_all(runner, queued));
            println!("ran {ran} tasks");
            print_tasks(task_store.as_ref())?;
        }
        TasksCommand::List => print_tasks(task_store.as_ref())?,
        TasksCommand::Cleanup => {
            let report = cleanup_expired_tasks(task_store.as_ref(), &config, chrono::Utc::now())?;
            println!(
                "deleted {} tasks, removed {} artifacts",
                report.deleted, report.artifacts_removed
            );
        }
    }
    Ok(())
}

fn print_tasks(task_store: &LocalFsTaskStore) -> anyhow::Result<()> {
    for task in task_store.list().context("list tasks")? {
        let detail = match (&task.error, &task.output_path) {
            (Some(error), _) => error.clone(),
            (None, Some(path)) => path.display().to_string(),
            (None, None) => String::new(),
        };
        println!(
            "{}\t{}\t{:?}\t{}",
            task.task_id,
            task.kind.label(),
            task.status,
            detail
        );
    }
    Ok(())
}
