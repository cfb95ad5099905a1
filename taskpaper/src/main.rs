use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use taskpaper::NomTaskpaperParser;
use taskpaper::document::DocumentSnapshot;
use taskpaper::settings::Settings;
use taskpaper::storage::TaskpaperParser;
use taskpaper::sync::sync_tagged;
use taskpaper::workspace::{TaskpaperWorkspace, expand_inputs};

#[derive(Debug, Parser)]
#[command(
    name = "taskpaper",
    about = "Taskpaper tooling built on the taskpaper crate",
    version
)]
struct Cli {
    /// Enable verbose logging for debugging.
    #[arg(long, global = true)]
    verbose: bool,
    /// Settings file to use instead of the one in the user config directory.
    #[arg(long, global = true)]
    settings: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Parse taskpaper files and print their structure.
    Parse(ParseArgs),

    /// Print files in canonical layout.
    Tidy(TidyArgs),

    /// List tasks (or projects) carrying a tag.
    Tagged(TaggedArgs),

    /// Tidy and sort every file of a workspace by the workflow tags.
    Sort(WorkspaceArgs),

    /// Move done tasks of the archive project into each file's task log.
    Archive(WorkspaceArgs),

    /// Collect tasks carrying the sync tags into one document per tag.
    Sync(SyncArgs),

    /// Write a settings file with the default values.
    Init(InitArgs),
}

#[derive(Debug, Args)]
struct ParseArgs {
    /// Taskpaper files or directories containing taskpaper files.
    #[arg(required = true)]
    inputs: Vec<PathBuf>,
    /// Emit JSON instead of a debug representation.
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
struct TidyArgs {
    /// Taskpaper files or directories to tidy.
    #[arg(required = true)]
    inputs: Vec<PathBuf>,
    /// Overwrite the file instead of printing to stdout.
    #[arg(long)]
    in_place: bool,
}

#[derive(Debug, Args)]
struct TaggedArgs {
    /// Tag to look for, with or without the leading `@`.
    tag: String,
    #[arg(required = true)]
    inputs: Vec<PathBuf>,
    /// List projects instead of tasks.
    #[arg(long)]
    projects: bool,
}

#[derive(Debug, Args)]
struct WorkspaceArgs {
    /// A taskpaper file or a directory of them.
    workspace: PathBuf,
}

#[derive(Debug, Args)]
struct SyncArgs {
    /// A taskpaper file or a directory of them.
    workspace: PathBuf,
    /// Folder receiving one `<tag>.taskpaper` per sync tag.
    sync_folder: PathBuf,
}

#[derive(Debug, Args)]
struct InitArgs {
    /// Where to write the settings; defaults to the user config directory.
    path: Option<PathBuf>,
    /// Replace an existing file.
    #[arg(long)]
    force: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    let settings_path = cli.settings;
    match cli.command {
        Commands::Parse(args) => handle_parse(args),
        Commands::Tidy(args) => handle_tidy(args),
        Commands::Tagged(args) => handle_tagged(args),
        Commands::Sort(args) => handle_sort(args, load_settings(settings_path.as_deref())?),
        Commands::Archive(args) => handle_archive(args, load_settings(settings_path.as_deref())?),
        Commands::Sync(args) => handle_sync(args, load_settings(settings_path.as_deref())?),
        Commands::Init(args) => handle_init(args, settings_path),
    }
}

fn init_logging(verbose: bool) {
    let default_level = if verbose { "debug" } else { "warn" };
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .format_timestamp(None)
        .try_init();
}

fn load_settings(path: Option<&Path>) -> Result<Settings> {
    Settings::load(path).context("loading settings")
}

fn parse_inputs(inputs: &[PathBuf]) -> Result<Vec<(PathBuf, taskpaper::Document)>> {
    let expanded = expand_inputs(inputs)?;
    if expanded.is_empty() {
        anyhow::bail!("no taskpaper files found in the provided inputs");
    }
    let parser = NomTaskpaperParser;
    expanded
        .into_iter()
        .map(|path| {
            log::debug!("parsing {:?}", path);
            let doc = parser.parse_file(&path)?;
            Ok((path, doc))
        })
        .collect()
}

fn handle_parse(args: ParseArgs) -> Result<()> {
    let ParseArgs { inputs, json } = args;
    let parsed = parse_inputs(&inputs)?;

    if json {
        let payload: Vec<DocumentSnapshot> = parsed.iter().map(|(_, doc)| doc.snapshot()).collect();
        println!("{}", serde_json::to_string_pretty(&payload)?);
    } else {
        for (idx, (path, doc)) in parsed.iter().enumerate() {
            if parsed.len() > 1 {
                println!("== {} ==", path.display());
            }
            println!("{:#?}", doc.snapshot().root);
            if parsed.len() > 1 && idx + 1 < parsed.len() {
                println!();
            }
        }
    }
    Ok(())
}

fn handle_tidy(args: TidyArgs) -> Result<()> {
    let TidyArgs { inputs, in_place } = args;
    let parsed = parse_inputs(&inputs)?;
    let many = parsed.len() > 1;

    for (idx, (path, mut doc)) in parsed.into_iter().enumerate() {
        doc.tidy();
        if in_place {
            doc.save(None).with_context(|| format!("writing {:?}", path))?;
            continue;
        }
        if many {
            if idx > 0 {
                println!();
            }
            println!("== {} ==", path.display());
        }
        println!("{}", doc.content());
    }
    Ok(())
}

fn handle_tagged(args: TaggedArgs) -> Result<()> {
    let TaggedArgs {
        tag,
        inputs,
        projects,
    } = args;
    let parsed = parse_inputs(&inputs)?;

    let mut found = 0;
    for (path, doc) in &parsed {
        let nodes = if projects {
            doc.tagged_projects(&tag)
        } else {
            doc.tagged_tasks(&tag)
        };
        for node in nodes {
            println!("{}: {}", path.display(), node.header());
            found += 1;
        }
    }
    if found == 0 {
        eprintln!("Nothing tagged @{} in the provided inputs.", tag.trim_start_matches('@'));
    }
    Ok(())
}

fn handle_sort(args: WorkspaceArgs, settings: Settings) -> Result<()> {
    let ws = TaskpaperWorkspace::scan(&args.workspace, settings)?;
    let sorted = ws.sort(&NomTaskpaperParser)?;
    println!("Sorted {sorted} taskpaper file(s) under {:?}", ws.root_abs);
    Ok(())
}

fn handle_archive(args: WorkspaceArgs, settings: Settings) -> Result<()> {
    let ws = TaskpaperWorkspace::scan(&args.workspace, settings)?;
    let archived = ws.archive_done(&NomTaskpaperParser)?;
    println!("Archived done tasks from {archived} file(s)");
    Ok(())
}

fn handle_sync(args: SyncArgs, settings: Settings) -> Result<()> {
    let mut ws = TaskpaperWorkspace::scan(&args.workspace, settings)?;
    for path in sync_tagged(&mut ws, &NomTaskpaperParser, &args.sync_folder)? {
        println!("Wrote {:?}", path);
    }
    Ok(())
}

fn handle_init(args: InitArgs, settings_path: Option<PathBuf>) -> Result<()> {
    let path = resolve_init_path(args.path, settings_path)?;
    if path.exists() && !args.force {
        anyhow::bail!("{:?} already exists; pass --force to replace it", path);
    }
    Settings::write_default(&path)?;
    println!("Wrote default settings to {:?}", path);
    Ok(())
}

fn resolve_init_path(explicit: Option<PathBuf>, settings_path: Option<PathBuf>) -> Result<PathBuf> {
    explicit
        .or(settings_path)
        .or_else(Settings::default_path)
        .context("could not determine the user config directory")
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use std::fs;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn global_flags_follow_subcommands() {
        let cli = Cli::try_parse_from([
            "taskpaper",
            "sync",
            "lists",
            "out",
            "--verbose",
            "--settings",
            "conf.yaml",
        ])
        .expect("parse");
        assert!(cli.verbose);
        assert_eq!(cli.settings, Some(PathBuf::from("conf.yaml")));
        assert!(matches!(cli.command, Commands::Sync(_)));
    }

    #[test]
    fn init_path_prefers_positional_then_settings_flag() {
        let resolved = resolve_init_path(Some("a.yaml".into()), Some("b.yaml".into())).expect("path");
        assert_eq!(resolved, PathBuf::from("a.yaml"));
        let resolved = resolve_init_path(None, Some("b.yaml".into())).expect("path");
        assert_eq!(resolved, PathBuf::from("b.yaml"));
    }

    #[test]
    fn init_refuses_to_overwrite_without_force() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let path = tmp.path().join("taskpaper.yaml");
        fs::write(&path, "syncTags: flag\n").expect("write");

        let keep = InitArgs {
            path: Some(path.clone()),
            force: false,
        };
        assert!(handle_init(keep, None).is_err());
        assert_eq!(fs::read_to_string(&path).expect("read"), "syncTags: flag\n");

        let replace = InitArgs {
            path: Some(path.clone()),
            force: true,
        };
        handle_init(replace, None).expect("init");
        assert_eq!(Settings::load(Some(&path)).expect("load"), Settings::default());
    }

    #[test]
    fn parse_inputs_rejects_empty_directories() {
        let tmp = tempfile::tempdir().expect("tempdir");
        assert!(parse_inputs(&[tmp.path().to_path_buf()]).is_err());
    }
}
