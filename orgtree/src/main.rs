use std::{
    collections::{BTreeSet, HashSet},
    fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use orgtree::storage::{JsonTreeStore, OrgParser, TreeStore};
use orgtree::{
    DuplicateHashPolicy, LineEnding, NodeRef, OrgTree, ParseOptions, PlanningKind, TreeBuilder,
    WriteOptions, write_tree,
};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(
    name = "orgtree",
    about = "Parse, query and rewrite hashed org outlines",
    version
)]
struct Cli {
    /// Enable debug logging on stderr.
    #[arg(long, global = true)]
    verbose: bool,
    /// Fail when two headings declare the same hash.
    #[arg(long, global = true)]
    strict_hashes: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Parse outlines and print their heading structure.
    Parse(ParseArgs),

    /// Write outlines back out, unchanged apart from heading line endings.
    Format(FormatArgs),

    /// Look up headings by hash or tag.
    Find(FindArgs),

    /// List SCHEDULED, DEADLINE and CLOSED entries.
    Planning(PlanningArgs),

    /// Store a parsed outline as a JSON snapshot.
    Snapshot(SnapshotArgs),

    /// Turn a JSON snapshot back into outline text.
    Restore(RestoreArgs),
}

#[derive(Debug, Args)]
struct ParseArgs {
    /// Org files or directories containing Org files to parse.
    #[arg(required = true)]
    inputs: Vec<PathBuf>,
    /// Emit the JSON snapshot form instead of an outline.
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
struct FormatArgs {
    /// Org files or directories to format.
    #[arg(required = true)]
    inputs: Vec<PathBuf>,
    /// Overwrite the file instead of printing to stdout.
    #[arg(long)]
    in_place: bool,
    /// Terminator for heading lines.
    #[arg(long, value_enum, default_value_t = EolArg::Preserve)]
    line_ending: EolArg,
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum EolArg {
    Preserve,
    Lf,
    Crlf,
}

impl From<EolArg> for LineEnding {
    fn from(arg: EolArg) -> Self {
        match arg {
            EolArg::Preserve => LineEnding::Preserve,
            EolArg::Lf => LineEnding::Lf,
            EolArg::Crlf => LineEnding::CrLf,
        }
    }
}

#[derive(Debug, Args)]
struct FindArgs {
    /// Org file to search.
    input: PathBuf,
    /// Five character heading hash.
    #[arg(long, conflicts_with = "tag", required_unless_present = "tag")]
    hash: Option<String>,
    /// Tag name, without colons.
    #[arg(long)]
    tag: Option<String>,
}

#[derive(Debug, Args)]
struct PlanningArgs {
    /// Org files or directories to scan.
    #[arg(required = true)]
    inputs: Vec<PathBuf>,
    /// Emit JSON instead of one line per entry.
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
struct SnapshotArgs {
    /// Org file to snapshot.
    input: PathBuf,
    /// Destination of the JSON snapshot.
    #[arg(long)]
    out: PathBuf,
}

#[derive(Debug, Args)]
struct RestoreArgs {
    /// JSON snapshot written by `snapshot`.
    snapshot: PathBuf,
    /// Write the outline here instead of stdout.
    #[arg(long)]
    out: Option<PathBuf>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    let parser = TreeBuilder::new(ParseOptions {
        duplicate_hashes: if cli.strict_hashes {
            DuplicateHashPolicy::Reject
        } else {
            DuplicateHashPolicy::LastWins
        },
    });
    match cli.command {
        Commands::Parse(args) => handle_parse(args, &parser),
        Commands::Format(args) => handle_format(args, &parser),
        Commands::Find(args) => handle_find(args, &parser),
        Commands::Planning(args) => handle_planning(args, &parser),
        Commands::Snapshot(args) => handle_snapshot(args, &parser),
        Commands::Restore(args) => handle_restore(args),
    }
}

fn init_tracing(verbose: bool) {
    let level = if verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::WARN
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(level.into()))
        .with_writer(std::io::stderr)
        .init();
}

fn parse_all(inputs: &[PathBuf], parser: &impl OrgParser) -> Result<Vec<(PathBuf, OrgTree)>> {
    let expanded = expand_inputs(inputs)?;
    if expanded.is_empty() {
        anyhow::bail!("no Org files found in the provided inputs");
    }
    let mut parsed = Vec::new();
    for path in expanded {
        debug!(?path, "parsing");
        let tree = parser.parse_file(&path)?;
        parsed.push((path, tree));
    }
    Ok(parsed)
}

fn handle_parse(args: ParseArgs, parser: &impl OrgParser) -> Result<()> {
    let ParseArgs { inputs, json } = args;
    let parsed = parse_all(&inputs, parser)?;

    if json {
        #[derive(serde::Serialize)]
        struct JsonOutput<'a> {
            path: String,
            tree: &'a OrgTree,
        }

        let payload: Vec<JsonOutput<'_>> = parsed
            .iter()
            .map(|(path, tree)| JsonOutput {
                path: path.display().to_string(),
                tree,
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&payload)?);
    } else {
        for (idx, (path, tree)) in parsed.iter().enumerate() {
            if parsed.len() > 1 {
                println!("== {} ==", path.display());
            }
            print!("{}", outline(tree));
            if parsed.len() > 1 && idx + 1 < parsed.len() {
                println!();
            }
        }
    }
    Ok(())
}

/// Heading lines only, followed by a one-line summary.
fn outline(tree: &OrgTree) -> String {
    let mut out = String::new();
    for node in tree.iter() {
        if let Some(header) = node.header() {
            out.push_str(&header.format());
            out.push('\n');
        }
    }
    out.push_str(&format!(
        "-- {} headings, {} hashes, {} tags\n",
        tree.len(),
        tree.hashes().count(),
        tree.tags().count()
    ));
    out
}

fn handle_format(args: FormatArgs, parser: &impl OrgParser) -> Result<()> {
    let FormatArgs {
        inputs,
        in_place,
        line_ending,
    } = args;
    let options = WriteOptions {
        line_ending: line_ending.into(),
    };
    let parsed = parse_all(&inputs, parser)?;
    let mut first = true;

    for (path, tree) in parsed {
        let formatted = write_tree(&tree, &options);
        if in_place {
            fs::write(&path, formatted.as_bytes())
                .with_context(|| format!("writing {:?}", path))?;
            info!(?path, "formatted in place");
        } else {
            if !first {
                println!();
                println!("== {} ==", path.display());
            } else if inputs.len() > 1 {
                println!("== {} ==", path.display());
            }
            first = false;
            print!("{formatted}");
        }
    }

    Ok(())
}

fn handle_find(args: FindArgs, parser: &impl OrgParser) -> Result<()> {
    let FindArgs { input, hash, tag } = args;
    let tree = parser.parse_file(&input)?;
    let matches = find_matches(&tree, hash.as_deref(), tag.as_deref());
    if matches.is_empty() {
        anyhow::bail!("no heading matches in {:?}", input);
    }
    for node in matches {
        println!("{}", breadcrumb(node));
        if let Some(header) = node.header() {
            println!("  {}", header.format());
        }
    }
    Ok(())
}

fn find_matches<'a>(tree: &'a OrgTree, hash: Option<&str>, tag: Option<&str>) -> Vec<NodeRef<'a>> {
    match (hash, tag) {
        (Some(hash), _) => tree.get_by_hash(hash).into_iter().collect(),
        (None, Some(tag)) => tree.get_by_tag(tag),
        (None, None) => Vec::new(),
    }
}

/// `Grandparent / Parent / Title`.
fn breadcrumb(node: NodeRef<'_>) -> String {
    let mut titles: Vec<&str> = node.ancestors().filter_map(|n| n.title()).collect();
    titles.reverse();
    titles.extend(node.title());
    titles.join(" / ")
}

#[derive(Debug, serde::Serialize)]
struct PlanningEntry {
    path: String,
    kind: PlanningKind,
    timestamp: String,
    hash: Option<String>,
    context: String,
    overdue_repeater: bool,
}

fn collect_planning(path: &Path, tree: &OrgTree) -> Result<Vec<PlanningEntry>> {
    let mut entries = Vec::new();
    for node in tree.iter().filter(|n| !n.is_root()) {
        let data = node
            .body_data()
            .with_context(|| format!("reading planning under {:?}", breadcrumb(node)))?;
        for schedule in data.planning() {
            entries.push(PlanningEntry {
                path: path.display().to_string(),
                kind: schedule.kind(),
                timestamp: schedule.timestamp().to_string(),
                hash: node.hash().map(str::to_string),
                context: breadcrumb(node),
                overdue_repeater: schedule.timestamp().has_overdue_repeater(),
            });
        }
    }
    Ok(entries)
}

fn handle_planning(args: PlanningArgs, parser: &impl OrgParser) -> Result<()> {
    let PlanningArgs { inputs, json } = args;
    let mut entries = Vec::new();
    for (path, tree) in parse_all(&inputs, parser)? {
        entries.extend(collect_planning(&path, &tree)?);
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&entries)?);
        return Ok(());
    }
    for entry in &entries {
        println!(
            "{:<9} {}  {}",
            entry.kind.keyword(),
            entry.timestamp,
            entry.context
        );
    }
    Ok(())
}

fn handle_snapshot(args: SnapshotArgs, parser: &impl OrgParser) -> Result<()> {
    let SnapshotArgs { input, out } = args;
    let tree = parser.parse_file(&input)?;
    JsonTreeStore::new(&out).save(&tree)?;
    info!(?input, ?out, "snapshot written");
    Ok(())
}

fn handle_restore(args: RestoreArgs) -> Result<()> {
    let RestoreArgs { snapshot, out } = args;
    let tree = JsonTreeStore::new(&snapshot).load()?;
    let text = write_tree(&tree, &WriteOptions::default());
    match out {
        Some(path) => {
            fs::write(&path, text.as_bytes()).with_context(|| format!("writing {:?}", path))?
        }
        None => print!("{text}"),
    }
    Ok(())
}

fn collect_org_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut out = Vec::new();
    let mut visited = HashSet::new();
    visit_dir(dir, &mut out, &mut visited)?;
    out.sort();
    out.dedup();
    Ok(out)
}

fn is_org_file(path: &Path) -> bool {
    path.extension().map(|ext| ext == "org").unwrap_or(false)
}

fn expand_inputs(paths: &[PathBuf]) -> Result<Vec<PathBuf>> {
    let mut out = Vec::new();
    let mut visited = BTreeSet::new();
    for path in paths {
        let canonical =
            fs::canonicalize(path).with_context(|| format!("resolving path {:?}", path))?;
        let meta = fs::metadata(&canonical)
            .with_context(|| format!("reading metadata for {:?}", canonical))?;
        if meta.is_dir() {
            debug!(dir = ?canonical, "scanning directory");
            for file in collect_org_files(&canonical)? {
                if visited.insert(file.clone()) {
                    out.push(file);
                }
            }
        } else if meta.is_file() {
            if !is_org_file(&canonical) {
                anyhow::bail!("{:?} is not an .org file", canonical);
            }
            if visited.insert(canonical.clone()) {
                out.push(canonical);
            }
        }
    }
    Ok(out)
}

fn visit_dir(path: &Path, out: &mut Vec<PathBuf>, visited: &mut HashSet<PathBuf>) -> Result<()> {
    let canonical = fs::canonicalize(path)?;
    if !visited.insert(canonical.clone()) {
        return Ok(());
    }

    let metadata = fs::metadata(&canonical)?;
    if metadata.is_dir() {
        for entry in fs::read_dir(&canonical)? {
            let entry = entry?;
            if entry.file_type()?.is_symlink() {
                continue;
            }
            visit_dir(&entry.path(), out, visited)?;
        }
    } else if metadata.is_file() && is_org_file(&canonical) {
        debug!(file = ?canonical, "found org file");
        out.push(canonical);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    const NOTES: &str = "\
#+TITLE: notes
* 12345: Home
** TODO 23456: Pay rent :money:
SCHEDULED: <2013-09-20 Fri +1m>
** 34567: Garden\r
DEADLINE: <2013-09-21 Sat>
* abcde: Work :money:
";

    #[test]
    fn expand_inputs_collects_org_files_sorted() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let nested = tmp.path().join("nested");
        fs::create_dir_all(&nested).expect("mkdir nested");
        fs::write(tmp.path().join("b.org"), "* B\n").expect("write b");
        fs::write(nested.join("a.org"), "* A\n").expect("write a");
        fs::write(tmp.path().join("readme.txt"), "skip").expect("write txt");

        let found = expand_inputs(&[tmp.path().to_path_buf()]).expect("expand");
        let names: Vec<_> = found
            .iter()
            .filter_map(|p| p.file_name())
            .map(|n| n.to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, ["b.org", "a.org"]);
    }

    #[test]
    fn expand_inputs_rejects_other_files() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let txt = tmp.path().join("readme.txt");
        fs::write(&txt, "skip").expect("write txt");
        assert!(expand_inputs(&[txt]).is_err());
    }

    #[test]
    fn format_in_place_keeps_bytes() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let path = tmp.path().join("notes.org");
        fs::write(&path, NOTES).expect("write");
        handle_format(
            FormatArgs {
                inputs: vec![path.clone()],
                in_place: true,
                line_ending: EolArg::Preserve,
            },
            &TreeBuilder::default(),
        )
        .expect("format");
        assert_eq!(fs::read_to_string(&path).expect("read"), NOTES);
    }

    #[test]
    fn planning_entries_carry_context() {
        let tree = OrgTree::parse_str(NOTES).expect("parse");
        let entries = collect_planning(Path::new("notes.org"), &tree).expect("planning");
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].kind, PlanningKind::Scheduled);
        assert_eq!(entries[0].context, "Home / Pay rent");
        assert_eq!(entries[0].hash.as_deref(), Some("23456"));
        assert!(entries[0].overdue_repeater);
        assert_eq!(entries[1].kind, PlanningKind::Deadline);
        assert_eq!(entries[1].timestamp, "<2013-09-21 Sat>");
    }

    #[test]
    fn find_by_hash_or_tag() {
        let tree = OrgTree::parse_str(NOTES).expect("parse");
        let by_hash = find_matches(&tree, Some("34567"), None);
        assert_eq!(by_hash.len(), 1);
        assert_eq!(breadcrumb(by_hash[0]), "Home / Garden");
        let by_tag: Vec<_> = find_matches(&tree, None, Some("money"))
            .into_iter()
            .filter_map(|n| n.hash())
            .collect();
        assert_eq!(by_tag, ["23456", "abcde"]);
    }

    #[test]
    fn snapshot_then_restore_reproduces_text() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let org = tmp.path().join("notes.org");
        let json = tmp.path().join("notes.json");
        let back = tmp.path().join("restored.org");
        fs::write(&org, NOTES).expect("write");

        handle_snapshot(
            SnapshotArgs {
                input: org,
                out: json.clone(),
            },
            &TreeBuilder::default(),
        )
        .expect("snapshot");
        handle_restore(RestoreArgs {
            snapshot: json,
            out: Some(back.clone()),
        })
        .expect("restore");
        assert_eq!(fs::read_to_string(&back).expect("read"), NOTES);
    }

    #[test]
    fn outline_lists_headings() {
        let tree = OrgTree::parse_str(NOTES).expect("parse");
        let text = outline(&tree);
        assert!(text.starts_with("* 12345: Home\n** TODO 23456: Pay rent :money:\n"));
        assert!(text.ends_with("-- 4 headings, 4 hashes, 1 tags\n"));
    }
}
