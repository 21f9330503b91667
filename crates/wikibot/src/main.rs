use std::fs;
use std::io::{self, Read};
use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use clap::{Args, CommandFactory, Parser, Subcommand, ValueEnum};
use regex::Regex;
use serde::Serialize;
use tracing_subscriber::EnvFilter;
use wikibot_core::bot::add_text::AddText;
use wikibot_core::bot::category::{
    CategoryAdd, CategoryRemove, fix_category_redirects, listify_category, move_category,
};
use wikibot_core::bot::reflinks::RefLinks;
use wikibot_core::bot::{BotOptions, BotReport, PageSource, PageStatus, resolve_pages, run_bot};
use wikibot_core::citoid::{Citation, CitoidClient, CitoidFormat};
use wikibot_core::config::{BotConfig, load_config, patch_config, resolve_config_path};
use wikibot_core::flow::{Board, Post, Topic};
use wikibot_core::logentries::LogFilter;
use wikibot_core::page::SaveOptions;
use wikibot_core::site::MoveOptions;
use wikibot_core::superset::{QueryTarget, SupersetClient};
use wikibot_core::textlib::Position;
use wikibot_core::upload::{IgnoreWarnings, UploadOptions, UploadSource, upload_directory};
use wikibot_core::Site;

#[derive(Debug, Parser)]
#[command(
    name = "wikibot",
    version,
    about = "MediaWiki API client and bot runner"
)]
struct Cli {
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,
    #[arg(long, global = true, value_name = "NAME", help = "Wiki family (wikipedia, wiktionary, ...)")]
    family: Option<String>,
    #[arg(long, global = true, value_name = "CODE", help = "Language or site code")]
    code: Option<String>,
    #[arg(long, global = true, help = "Compute edits without saving them")]
    dry_run: bool,
    #[arg(short, long, global = true, action = clap::ArgAction::Count, help = "More logging (-vv for trace)")]
    verbose: u8,
    #[arg(short, long, global = true, conflicts_with = "verbose", help = "Only log errors")]
    quiet: bool,
    #[arg(long, global = true, help = "Print reports as JSON")]
    json: bool,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Clone)]
struct RuntimeOptions {
    config: BotConfig,
    config_path: PathBuf,
    dry_run: bool,
    json: bool,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Log in with the configured account and show who we are.
    Login,
    Logout,
    Whoami,
    Siteinfo,
    /// Print the wikitext of a page.
    Get(GetArgs),
    /// Replace the wikitext of a page.
    Put(PutArgs),
    History(HistoryArgs),
    Move(MoveArgs),
    Delete(DeleteArgs),
    Protect(ProtectArgs),
    Category(CategoryArgs),
    /// Turn bare URL references into filled-in citations.
    Reflinks(ReflinksArgs),
    #[command(name = "add-text")]
    AddText(AddTextArgs),
    Upload(UploadArgs),
    Log(LogArgs),
    Flow(FlowArgs),
    /// Run a SQL query through Superset.
    Superset(SupersetArgs),
    /// Look up citation metadata for a URL, DOI or ISBN.
    Citoid(CitoidArgs),
    Config(ConfigArgs),
}

#[derive(Debug, Args)]
struct GetArgs {
    title: String,
    #[arg(long, help = "Return redirect pages as they are")]
    allow_redirect: bool,
}

#[derive(Debug, Args)]
struct PutArgs {
    title: String,
    #[arg(long, value_name = "PATH", help = "Read text from a file instead of stdin")]
    file: Option<PathBuf>,
    #[arg(short, long)]
    summary: String,
    #[arg(long)]
    minor: bool,
}

#[derive(Debug, Args)]
struct HistoryArgs {
    title: String,
    #[arg(long, default_value_t = 10)]
    limit: usize,
}

#[derive(Debug, Args)]
struct MoveArgs {
    from: String,
    to: String,
    #[arg(long, default_value = "")]
    reason: String,
    #[arg(long)]
    no_redirect: bool,
    #[arg(long)]
    move_talk: bool,
    #[arg(long)]
    move_subpages: bool,
}

#[derive(Debug, Args)]
struct DeleteArgs {
    title: String,
    #[arg(long, default_value = "")]
    reason: String,
}

#[derive(Debug, Args)]
struct ProtectArgs {
    title: String,
    #[arg(long, value_name = "LEVEL", help = "Edit protection level (e.g. sysop, autoconfirmed, all)")]
    edit: Option<String>,
    #[arg(long = "move", value_name = "LEVEL")]
    move_level: Option<String>,
    #[arg(long, default_value = "infinite")]
    expiry: String,
    #[arg(long, default_value = "")]
    reason: String,
}

/// Where a bot run gets its pages from; exactly one source is required.
#[derive(Debug, Args)]
struct PageSourceArgs {
    #[arg(long = "page", value_name = "TITLE")]
    pages: Vec<String>,
    #[arg(long, value_name = "NAME")]
    cat: Option<String>,
    #[arg(long, value_name = "DEPTH", requires = "cat")]
    recurse: Option<usize>,
    #[arg(long, value_name = "QUERY")]
    search: Option<String>,
    #[arg(long, value_name = "TITLE")]
    links_to: Option<String>,
    #[arg(long, value_name = "TEMPLATE")]
    transcludes: Option<String>,
    #[arg(long, value_name = "PREFIX")]
    prefix: Option<String>,
    #[arg(long, default_value_t = 0)]
    namespace: i32,
}

impl PageSourceArgs {
    fn source(&self) -> Result<PageSource> {
        let mut sources = Vec::new();
        if !self.pages.is_empty() {
            sources.push(PageSource::Titles(self.pages.clone()));
        }
        if let Some(name) = &self.cat {
            sources.push(PageSource::Category {
                name: name.clone(),
                recurse: self.recurse,
            });
        }
        if let Some(query) = &self.search {
            sources.push(PageSource::Search {
                query: query.clone(),
                namespaces: vec![self.namespace],
            });
        }
        if let Some(title) = &self.links_to {
            sources.push(PageSource::LinksTo(title.clone()));
        }
        if let Some(template) = &self.transcludes {
            sources.push(PageSource::TransclusionsOf(template.clone()));
        }
        if let Some(prefix) = &self.prefix {
            sources.push(PageSource::Prefix {
                prefix: prefix.clone(),
                namespace: self.namespace,
            });
        }
        match sources.len() {
            1 => Ok(sources.remove(0)),
            0 => bail!("no pages selected (use --page, --cat, --search, --links-to, --transcludes or --prefix)"),
            _ => bail!("choose a single page source"),
        }
    }
}

#[derive(Debug, Args)]
struct RunArgs {
    #[arg(short, long)]
    summary: Option<String>,
    #[arg(long)]
    minor: bool,
    #[arg(long, help = "Stop after this many pages")]
    limit: Option<usize>,
    #[arg(long, help = "Print a diff for every change")]
    show_diff: bool,
}

impl RunArgs {
    fn bot_options(&self, runtime: &RuntimeOptions) -> BotOptions {
        BotOptions {
            dry_run: runtime.dry_run,
            summary: self.summary.clone(),
            summary_prefix: runtime.config.bot.summary_prefix.clone(),
            minor: self.minor,
            limit: self.limit,
            show_diff: self.show_diff,
        }
    }
}

#[derive(Debug, Args)]
struct CategoryArgs {
    #[command(subcommand)]
    command: CategorySubcommand,
}

#[derive(Debug, Subcommand)]
enum CategorySubcommand {
    Add {
        category: String,
        #[arg(long)]
        sort_key: Option<String>,
        #[command(flatten)]
        pages: PageSourceArgs,
        #[command(flatten)]
        run: RunArgs,
    },
    Remove {
        category: String,
        #[command(flatten)]
        pages: PageSourceArgs,
        #[command(flatten)]
        run: RunArgs,
    },
    /// Move a category and recategorize its members.
    Move {
        old: String,
        new: String,
        #[command(flatten)]
        run: RunArgs,
    },
    /// Write the members of a category as a bulleted list.
    List {
        category: String,
        #[arg(long, value_name = "TITLE", help = "Save the list to this page")]
        target: Option<String>,
        #[arg(long)]
        subcats: bool,
        #[command(flatten)]
        run: RunArgs,
    },
    /// Empty soft-redirected categories into their targets.
    Redirects {
        #[command(flatten)]
        run: RunArgs,
    },
}

#[derive(Debug, Args)]
struct ReflinksArgs {
    #[command(flatten)]
    pages: PageSourceArgs,
    #[command(flatten)]
    run: RunArgs,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum PositionArg {
    Top,
    Bottom,
    BeforeCategories,
}

impl From<PositionArg> for Position {
    fn from(value: PositionArg) -> Self {
        match value {
            PositionArg::Top => Position::Top,
            PositionArg::Bottom => Position::Bottom,
            PositionArg::BeforeCategories => Position::BeforeCategories,
        }
    }
}

#[derive(Debug, Args)]
struct AddTextArgs {
    #[arg(long)]
    text: String,
    #[arg(long, value_enum, default_value = "bottom")]
    position: PositionArg,
    #[arg(long, value_name = "REGEX", help = "Skip pages whose text matches")]
    skip_if: Option<String>,
    #[arg(long, help = "Edit the talk pages instead")]
    talk_page: bool,
    #[command(flatten)]
    pages: PageSourceArgs,
    #[command(flatten)]
    run: RunArgs,
}

#[derive(Debug, Args)]
struct UploadArgs {
    #[arg(help = "File or directory to upload, or a URL with --from-url")]
    source: String,
    #[arg(long, help = "Let the wiki fetch the file from SOURCE")]
    from_url: bool,
    #[arg(long, value_name = "NAME", help = "Target file name (single uploads)")]
    filename: Option<String>,
    #[arg(long, default_value = "")]
    comment: String,
    #[arg(long, help = "Description page text for new files")]
    text: Option<String>,
    #[arg(long, value_name = "BYTES", default_value_t = 0, help = "Upload in chunks of this size")]
    chunk_size: usize,
    #[arg(long, value_name = "WARNING", num_args = 0.., help = "Ignore all warnings, or only those named")]
    ignore_warnings: Option<Vec<String>>,
}

#[derive(Debug, Args)]
struct LogArgs {
    #[arg(long = "type", value_name = "TYPE")]
    log_type: Option<String>,
    #[arg(long)]
    action: Option<String>,
    #[arg(long)]
    user: Option<String>,
    #[arg(long)]
    title: Option<String>,
    #[arg(long, default_value_t = 20)]
    limit: usize,
    #[arg(long, help = "Oldest first")]
    reverse: bool,
}

#[derive(Debug, Args)]
struct FlowArgs {
    #[command(subcommand)]
    command: FlowSubcommand,
}

#[derive(Debug, Subcommand)]
enum FlowSubcommand {
    Topics {
        board: String,
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    #[command(name = "new-topic")]
    NewTopic {
        board: String,
        subject: String,
        content: String,
    },
    Reply {
        topic: String,
        content: String,
        #[arg(long, value_name = "UUID", help = "Reply to this post instead of the topic")]
        post: Option<String>,
    },
    Lock {
        topic: String,
        #[arg(long, default_value = "")]
        reason: String,
    },
    Unlock {
        topic: String,
        #[arg(long, default_value = "")]
        reason: String,
    },
}

#[derive(Debug, Args)]
struct SupersetArgs {
    sql: String,
    #[arg(long, value_name = "DB", help = "Database schema, e.g. enwiki_p")]
    schema: Option<String>,
    #[arg(long, conflicts_with = "schema")]
    database_id: Option<i64>,
}

#[derive(Debug, Args)]
struct CitoidArgs {
    query: String,
    #[arg(long, default_value = "mediawiki")]
    format: String,
}

#[derive(Debug, Args)]
struct ConfigArgs {
    #[command(subcommand)]
    command: ConfigSubcommand,
}

#[derive(Debug, Subcommand)]
enum ConfigSubcommand {
    /// Set `section.key` in the config file; an empty value removes it.
    Set { key: String, value: String },
}

fn main() -> Result<()> {
    let mut cli = Cli::parse();
    dotenvy::dotenv().ok();
    init_tracing(cli.verbose, cli.quiet);

    let Some(command) = cli.command.take() else {
        let mut command = Cli::command();
        command.print_help()?;
        println!();
        return Ok(());
    };
    let runtime = load_runtime(&cli)?;

    match command {
        Commands::Login => run_login(&runtime),
        Commands::Logout => run_logout(&runtime),
        Commands::Whoami => run_whoami(&runtime),
        Commands::Siteinfo => run_siteinfo(&runtime),
        Commands::Get(args) => run_get(&runtime, args),
        Commands::Put(args) => run_put(&runtime, args),
        Commands::History(args) => run_history(&runtime, args),
        Commands::Move(args) => run_move(&runtime, args),
        Commands::Delete(args) => run_delete(&runtime, args),
        Commands::Protect(args) => run_protect(&runtime, args),
        Commands::Category(CategoryArgs { command }) => run_category(&runtime, command),
        Commands::Reflinks(args) => run_reflinks(&runtime, args),
        Commands::AddText(args) => run_add_text(&runtime, args),
        Commands::Upload(args) => run_upload(&runtime, args),
        Commands::Log(args) => run_log(&runtime, args),
        Commands::Flow(FlowArgs { command }) => run_flow(&runtime, command),
        Commands::Superset(args) => run_superset(&runtime, args),
        Commands::Citoid(args) => run_citoid(&runtime, args),
        Commands::Config(ConfigArgs { command }) => match command {
            ConfigSubcommand::Set { key, value } => run_config_set(&runtime, &key, &value),
        },
    }
}

fn init_tracing(verbose: u8, quiet: bool) {
    let default_level = match (quiet, verbose) {
        (true, _) => "error",
        (false, 0) => "info",
        (false, 1) => "debug",
        (false, _) => "trace",
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(false)
        .init();
}

fn load_runtime(cli: &Cli) -> Result<RuntimeOptions> {
    let cwd = std::env::current_dir().context("failed to resolve current directory")?;
    let config_path = resolve_config_path(cli.config.as_deref(), &cwd);
    let mut config = load_config(&config_path)?;
    config.overrides.family = cli.family.clone();
    config.overrides.code = cli.code.clone();
    Ok(RuntimeOptions {
        config,
        config_path,
        dry_run: cli.dry_run,
        json: cli.json,
    })
}

fn open_site(runtime: &RuntimeOptions) -> Result<Site> {
    Site::from_config(&runtime.config).with_context(|| {
        format!(
            "failed to set up {}:{}",
            runtime.config.family(),
            runtime.config.code()
        )
    })
}

/// Site logged in with the configured account, or anonymous when there is
/// none.
fn open_site_for_writes(runtime: &RuntimeOptions) -> Result<Site> {
    let mut site = open_site(runtime)?;
    if runtime.config.username().is_none() {
        tracing::warn!("no account configured; editing anonymously");
        return Ok(site);
    }
    let user = site.login().context("login failed")?;
    tracing::info!(user = user.name.as_str(), "logged in");
    Ok(site)
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn run_login(runtime: &RuntimeOptions) -> Result<()> {
    if runtime.config.username().is_none() {
        bail!(
            "no account configured; set [account] username/password in {} or WIKIBOT_USERNAME/WIKIBOT_PASSWORD",
            runtime.config_path.display()
        );
    }
    let mut site = open_site(runtime)?;
    let user = site.login().context("login failed")?;
    print_user(runtime, &site, &user)
}

fn run_logout(runtime: &RuntimeOptions) -> Result<()> {
    let mut site = open_site_for_writes(runtime)?;
    site.logout().context("logout failed")?;
    println!("logged_out: yes");
    Ok(())
}

fn run_whoami(runtime: &RuntimeOptions) -> Result<()> {
    let mut site = if runtime.config.username().is_some() {
        open_site_for_writes(runtime)?
    } else {
        open_site(runtime)?
    };
    let user = site.user()?;
    print_user(runtime, &site, &user)
}

fn print_user(
    runtime: &RuntimeOptions,
    site: &Site,
    user: &wikibot_core::login::UserInfo,
) -> Result<()> {
    if runtime.json {
        return print_json(user);
    }
    println!("site: {}:{}", site.family().name, site.code());
    println!("user: {}", user.name);
    println!("anonymous: {}", format_flag(user.anon));
    println!("groups: {}", user.groups.join(", "));
    if let Some(blocked_by) = &user.blocked_by {
        println!("blocked_by: {blocked_by}");
        println!(
            "block_reason: {}",
            user.block_reason.as_deref().unwrap_or("")
        );
    }
    Ok(())
}

fn run_siteinfo(runtime: &RuntimeOptions) -> Result<()> {
    let mut site = open_site(runtime)?;
    let info = site.load_siteinfo()?;
    if runtime.json {
        return print_json(&info);
    }
    println!("sitename: {}", info.sitename);
    println!("mainpage: {}", info.mainpage);
    println!("lang: {}", info.lang);
    println!("generator: {}", info.generator);
    println!("server: {}", info.server);
    println!("articlepath: {}", info.articlepath);
    println!("api_url: {}", site.api_url());
    println!("readonly: {}", format_flag(info.readonly));
    Ok(())
}

fn run_get(runtime: &RuntimeOptions, args: GetArgs) -> Result<()> {
    let mut site = open_site(runtime)?;
    let mut page = site.page(&args.title)?;
    let text = page
        .get(&mut site, args.allow_redirect)
        .with_context(|| format!("failed to read [[{}]]", args.title))?;
    if runtime.json {
        return print_json(&serde_json::json!({
            "title": page.title().full_title(),
            "text": text,
        }));
    }
    print!("{text}");
    if !text.ends_with('\n') {
        println!();
    }
    Ok(())
}

fn run_put(runtime: &RuntimeOptions, args: PutArgs) -> Result<()> {
    let text = match &args.file {
        Some(path) => fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?,
        None => {
            let mut buffer = String::new();
            io::stdin()
                .read_to_string(&mut buffer)
                .context("failed to read text from stdin")?;
            buffer
        }
    };
    let mut site = open_site_for_writes(runtime)?;
    let mut page = site.page(&args.title)?;

    if runtime.dry_run {
        let old = if page.exists(&mut site)? {
            page.text(&mut site)?
        } else {
            String::new()
        };
        let title = page.title().full_title();
        print!("{}", wikibot_core::bot::unified_diff(&title, &old, &text));
        println!("dry_run: yes");
        return Ok(());
    }

    let options = SaveOptions {
        minor: args.minor,
        ..SaveOptions::default()
    };
    let result = page
        .save(&mut site, &text, &args.summary, &options)
        .with_context(|| format!("failed to save [[{}]]", args.title))?;
    if runtime.json {
        return print_json(&result);
    }
    println!("title: {}", result.title);
    println!("nochange: {}", format_flag(result.nochange));
    if let Some(revid) = result.new_revid {
        println!("revid: {revid}");
    }
    Ok(())
}

fn run_history(runtime: &RuntimeOptions, args: HistoryArgs) -> Result<()> {
    let mut site = open_site(runtime)?;
    let page = site.page(&args.title)?;
    let revisions = page.revisions(&mut site, Some(args.limit), false)?;
    if runtime.json {
        return print_json(&revisions);
    }
    for revision in &revisions {
        println!(
            "{} {} {} {}{}",
            revision.revid,
            revision.timestamp,
            revision.user.as_deref().unwrap_or("(hidden)"),
            if revision.minor { "m " } else { "" },
            revision.comment.as_deref().unwrap_or("")
        );
    }
    Ok(())
}

fn run_move(runtime: &RuntimeOptions, args: MoveArgs) -> Result<()> {
    let mut site = open_site_for_writes(runtime)?;
    let mut page = site.page(&args.from)?;
    let target = site.parse_title(&args.to)?;
    if runtime.dry_run {
        println!("would_move: {} -> {}", page.title(), target);
        return Ok(());
    }
    let options = MoveOptions {
        move_talk: args.move_talk,
        move_subpages: args.move_subpages,
        no_redirect: args.no_redirect,
    };
    let moved = page
        .move_to(&mut site, &target, &args.reason, &options)
        .with_context(|| format!("failed to move [[{}]]", args.from))?;
    println!("moved: {} -> {}", args.from, moved.title());
    Ok(())
}

fn run_delete(runtime: &RuntimeOptions, args: DeleteArgs) -> Result<()> {
    let mut site = open_site_for_writes(runtime)?;
    let mut page = site.page(&args.title)?;
    if runtime.dry_run {
        println!("would_delete: {}", page.title());
        return Ok(());
    }
    page.delete(&mut site, &args.reason)
        .with_context(|| format!("failed to delete [[{}]]", args.title))?;
    println!("deleted: {}", page.title());
    Ok(())
}

fn run_protect(runtime: &RuntimeOptions, args: ProtectArgs) -> Result<()> {
    let mut protections = Vec::new();
    if let Some(level) = args.edit {
        protections.push(("edit".to_string(), level));
    }
    if let Some(level) = args.move_level {
        protections.push(("move".to_string(), level));
    }
    if protections.is_empty() {
        bail!("nothing to protect (use --edit and/or --move)");
    }
    let mut site = open_site_for_writes(runtime)?;
    let mut page = site.page(&args.title)?;
    let summary = protections
        .iter()
        .map(|(action, level)| format!("{action}={level}"))
        .collect::<Vec<_>>()
        .join("|");
    if runtime.dry_run {
        println!("would_protect: {} ({summary}, expires {})", page.title(), args.expiry);
        return Ok(());
    }
    page.protect(&mut site, &protections, &args.expiry, &args.reason)
        .with_context(|| format!("failed to protect [[{}]]", args.title))?;
    println!("protected: {}", page.title());
    println!("levels: {summary}");
    println!("expiry: {}", args.expiry);
    Ok(())
}

fn run_category(runtime: &RuntimeOptions, command: CategorySubcommand) -> Result<()> {
    let mut site = open_site_for_writes(runtime)?;
    match command {
        CategorySubcommand::Add {
            category,
            sort_key,
            pages,
            run,
        } => {
            let options = run.bot_options(runtime);
            let titles = resolve_pages(&mut site, &pages.source()?, options.limit)?;
            let mut transform = CategoryAdd {
                category: site.category(&category)?.title().clone(),
                sort_key,
            };
            let report = run_bot(&mut site, &titles, &mut transform, &options)?;
            print_report(runtime, &report)
        }
        CategorySubcommand::Remove {
            category,
            pages,
            run,
        } => {
            let options = run.bot_options(runtime);
            let titles = resolve_pages(&mut site, &pages.source()?, options.limit)?;
            let mut transform = CategoryRemove {
                category: site.category(&category)?.title().clone(),
            };
            let report = run_bot(&mut site, &titles, &mut transform, &options)?;
            print_report(runtime, &report)
        }
        CategorySubcommand::Move { old, new, run } => {
            let report = move_category(&mut site, &old, &new, &run.bot_options(runtime))?;
            if runtime.json {
                return print_json(&report);
            }
            println!("moved: {}", format_flag(report.moved));
            println!("recreated: {}", format_flag(report.recreated));
            println!("redirect_left: {}", format_flag(report.redirect_left));
            print_report(runtime, &report.members)
        }
        CategorySubcommand::List {
            category,
            target,
            subcats,
            run,
        } => {
            let list = listify_category(
                &mut site,
                &category,
                target.as_deref(),
                subcats,
                &run.bot_options(runtime),
            )?;
            if runtime.json {
                return print_json(&serde_json::json!({ "category": category, "list": list }));
            }
            print!("{list}");
            Ok(())
        }
        CategorySubcommand::Redirects { run } => {
            let fixes = fix_category_redirects(&mut site, &run.bot_options(runtime))?;
            if runtime.json {
                return print_json(&fixes);
            }
            println!("redirected_categories: {}", fixes.len());
            for fix in &fixes {
                println!(
                    "redirect: {} -> {} ({} moved)",
                    fix.from, fix.to, fix.members.saved
                );
            }
            Ok(())
        }
    }
}

fn run_reflinks(runtime: &RuntimeOptions, args: ReflinksArgs) -> Result<()> {
    let options = args.run.bot_options(runtime);
    let citoid = CitoidClient::from_config(&runtime.config)?;
    let mut site = open_site_for_writes(runtime)?;
    let titles = resolve_pages(&mut site, &args.pages.source()?, options.limit)?;
    let mut transform = RefLinks::new(citoid);
    let report = run_bot(&mut site, &titles, &mut transform, &options)?;
    print_report(runtime, &report)
}

fn run_add_text(runtime: &RuntimeOptions, args: AddTextArgs) -> Result<()> {
    let options = args.run.bot_options(runtime);
    let mut transform = AddText::new(&args.text);
    transform.position = args.position.into();
    transform.talk_page = args.talk_page;
    if let Some(pattern) = &args.skip_if {
        transform.skip_if = Some(
            Regex::new(pattern)
                .with_context(|| format!("invalid --skip-if pattern {pattern:?}"))?,
        );
    }
    let mut site = open_site_for_writes(runtime)?;
    let subjects = resolve_pages(&mut site, &args.pages.source()?, options.limit)?;
    let titles = transform.target_titles(&site, &subjects)?;
    let report = run_bot(&mut site, &titles, &mut transform, &options)?;
    print_report(runtime, &report)
}

fn run_upload(runtime: &RuntimeOptions, args: UploadArgs) -> Result<()> {
    let ignore_warnings = match args.ignore_warnings {
        None => IgnoreWarnings::None,
        Some(names) if names.is_empty() => IgnoreWarnings::All,
        Some(names) => IgnoreWarnings::Only(names),
    };
    let mut options = UploadOptions {
        comment: args.comment,
        text: args.text,
        chunk_size: args.chunk_size,
        ignore_warnings,
        ..UploadOptions::default()
    };

    let path = PathBuf::from(&args.source);
    if !args.from_url && path.is_dir() {
        if args.filename.is_some() {
            bail!("--filename cannot be used when uploading a directory");
        }
        if runtime.dry_run {
            println!("would_upload_directory: {}", path.display());
            return Ok(());
        }
        let mut site = open_site_for_writes(runtime)?;
        let results = upload_directory(&mut site, &path, &options)?;
        let mut failed = 0usize;
        for (file, result) in &results {
            match result {
                Ok(outcome) => println!("uploaded: {} -> File:{}", file.display(), outcome.filename),
                Err(error) => {
                    failed += 1;
                    println!("failed: {} ({error})", file.display());
                }
            }
        }
        println!("files: {}", results.len());
        println!("failed: {failed}");
        return Ok(());
    }

    let (source, default_name) = if args.from_url {
        let name = args
            .source
            .rsplit('/')
            .next()
            .unwrap_or_default()
            .to_string();
        (UploadSource::Url(args.source.clone()), name)
    } else {
        let name = path
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or_default()
            .to_string();
        (UploadSource::Path(path.clone()), name)
    };
    options.filename = args.filename.unwrap_or(default_name);
    if options.filename.is_empty() {
        bail!("cannot derive a file name from {}; pass --filename", args.source);
    }
    if runtime.dry_run {
        println!("would_upload: {} -> File:{}", args.source, options.filename);
        return Ok(());
    }

    let mut site = open_site_for_writes(runtime)?;
    let outcome = site
        .upload(source, &options)
        .with_context(|| format!("failed to upload {}", args.source))?;
    if runtime.json {
        return print_json(&outcome);
    }
    println!("filename: {}", outcome.filename);
    if !outcome.warnings.is_empty() {
        println!("ignored_warnings: {}", outcome.warnings.join(", "));
    }
    Ok(())
}

fn run_log(runtime: &RuntimeOptions, args: LogArgs) -> Result<()> {
    let mut site = open_site(runtime)?;
    let filter = LogFilter {
        log_type: args.log_type,
        action: args.action,
        user: args.user,
        title: args.title,
        reverse: args.reverse,
        limit: Some(args.limit),
        ..LogFilter::default()
    };
    let entries = site.log_events(&filter)?;
    if runtime.json {
        return print_json(&entries);
    }
    for entry in &entries {
        println!(
            "{} {}/{} {} {} {}",
            entry.timestamp,
            entry.log_type,
            entry.action.as_deref().unwrap_or("(hidden)"),
            entry.user.as_deref().unwrap_or("(hidden)"),
            entry.title.as_deref().unwrap_or("(hidden)"),
            entry.comment.as_deref().unwrap_or("")
        );
    }
    Ok(())
}

fn run_flow(runtime: &RuntimeOptions, command: FlowSubcommand) -> Result<()> {
    match command {
        FlowSubcommand::Topics { board, limit } => {
            let mut site = open_site(runtime)?;
            let board = Board::new(site.parse_title(&board)?);
            let topics = board.topics(&mut site, Some(limit))?;
            if runtime.json {
                return print_json(&topics);
            }
            for topic in &topics {
                println!(
                    "{} {}{}",
                    topic.page,
                    topic.title().unwrap_or(""),
                    if topic.is_locked() { " (locked)" } else { "" }
                );
            }
            Ok(())
        }
        FlowSubcommand::NewTopic {
            board,
            subject,
            content,
        } => {
            let mut site = open_site_for_writes(runtime)?;
            let board = Board::new(site.parse_title(&board)?);
            if runtime.dry_run {
                println!("would_post: {} ({subject})", board.title());
                return Ok(());
            }
            let topic = board.new_topic(&mut site, &subject, &content)?;
            print_topic(runtime, &topic)
        }
        FlowSubcommand::Reply {
            topic,
            content,
            post,
        } => {
            let mut site = open_site_for_writes(runtime)?;
            let topic = Topic::load(&mut site, &topic)?;
            if runtime.dry_run {
                println!("would_reply: {}", topic.page);
                return Ok(());
            }
            let reply = match post {
                Some(uuid) => Post::load(&mut site, &topic.page, &uuid)?.reply(&mut site, &content)?,
                None => topic.reply(&mut site, &content)?,
            };
            if runtime.json {
                return print_json(&reply);
            }
            println!("topic: {}", reply.topic);
            println!("post: {}", reply.uuid);
            Ok(())
        }
        FlowSubcommand::Lock { topic, reason } => {
            set_topic_lock(runtime, &topic, &reason, true)
        }
        FlowSubcommand::Unlock { topic, reason } => {
            set_topic_lock(runtime, &topic, &reason, false)
        }
    }
}

fn set_topic_lock(runtime: &RuntimeOptions, topic: &str, reason: &str, lock: bool) -> Result<()> {
    let mut site = open_site_for_writes(runtime)?;
    let mut topic = Topic::load(&mut site, topic)?;
    if runtime.dry_run {
        println!("would_{}: {}", if lock { "lock" } else { "unlock" }, topic.page);
        return Ok(());
    }
    if lock {
        topic.lock(&mut site, reason)?;
    } else {
        topic.unlock(&mut site, reason)?;
    }
    print_topic(runtime, &topic)
}

fn print_topic(runtime: &RuntimeOptions, topic: &Topic) -> Result<()> {
    if runtime.json {
        return print_json(topic);
    }
    println!("topic: {}", topic.page);
    println!("title: {}", topic.title().unwrap_or(""));
    println!("locked: {}", format_flag(topic.is_locked()));
    println!("posts: {}", topic.posts.len());
    Ok(())
}

fn run_superset(runtime: &RuntimeOptions, args: SupersetArgs) -> Result<()> {
    let target = match (args.schema, args.database_id.or(runtime.config.superset.database_id)) {
        (Some(schema), _) => QueryTarget::Schema(schema),
        (None, Some(id)) => QueryTarget::DatabaseId(id),
        (None, None) => bail!("choose a database with --schema or --database-id"),
    };
    let mut client = SupersetClient::from_config(&runtime.config)?;
    let user = client.check_login().context("Superset session is not valid")?;
    tracing::info!(user = user.as_str(), "superset session ok");
    let rows = client.query(&args.sql, &target)?;
    if runtime.json {
        return print_json(&rows);
    }
    println!("rows: {}", rows.len());
    for row in &rows {
        println!("{}", serde_json::to_string(row)?);
    }
    Ok(())
}

fn run_citoid(runtime: &RuntimeOptions, args: CitoidArgs) -> Result<()> {
    let Some(format) = CitoidFormat::parse(&args.format) else {
        bail!("unknown citation format {:?}", args.format);
    };
    let mut client = CitoidClient::from_config(&runtime.config)?;
    match client.citation(format, &args.query)? {
        Citation::Bibtex(text) => {
            print!("{text}");
            Ok(())
        }
        Citation::Json(items) if items.is_empty() => bail!("no citation found for {}", args.query),
        Citation::Json(items) => print_json(&items),
    }
}

fn run_config_set(runtime: &RuntimeOptions, key: &str, value: &str) -> Result<()> {
    let Some((section, field)) = key.split_once('.') else {
        bail!("config keys look like section.key (e.g. site.code), got {key:?}");
    };
    let changed = patch_config(&runtime.config_path, section, field, value)?;
    println!("config_path: {}", runtime.config_path.display());
    println!("changed: {}", format_flag(changed));
    Ok(())
}

fn print_report(runtime: &RuntimeOptions, report: &BotReport) -> Result<()> {
    if runtime.json {
        return print_json(report);
    }
    for outcome in &report.outcomes {
        let status = match &outcome.status {
            PageStatus::Saved { revid: Some(revid) } => format!("saved (r{revid})"),
            PageStatus::Saved { revid: None } => "saved".to_string(),
            PageStatus::WouldSave => "would save".to_string(),
            PageStatus::Unchanged => "unchanged".to_string(),
            PageStatus::Skipped { reason } => format!("skipped: {reason}"),
        };
        println!("page: {} {status}", outcome.title);
        if let Some(diff) = &outcome.diff {
            print!("{diff}");
        }
    }
    println!("processed: {}", report.processed);
    println!("saved: {}", report.saved);
    println!("unchanged: {}", report.unchanged);
    println!("skipped: {}", report.skipped);
    println!("dry_run: {}", format_flag(runtime.dry_run));
    Ok(())
}

fn format_flag(value: bool) -> &'static str {
    if value { "yes" } else { "no" }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn page_source_requires_exactly_one_choice() {
        let cli = Cli::parse_from(["wikibot", "reflinks", "--cat", "Stubs", "--recurse", "1"]);
        let Some(Commands::Reflinks(args)) = cli.command else {
            panic!("expected reflinks");
        };
        assert_eq!(
            args.pages.source().expect("source"),
            PageSource::Category {
                name: "Stubs".to_string(),
                recurse: Some(1)
            }
        );

        let cli = Cli::parse_from(["wikibot", "reflinks", "--page", "A", "--search", "x"]);
        let Some(Commands::Reflinks(args)) = cli.command else {
            panic!("expected reflinks");
        };
        assert!(args.pages.source().is_err());
    }

    #[test]
    fn global_flags_follow_subcommands() {
        let cli = Cli::parse_from([
            "wikibot", "add-text", "--text", "{{Stub}}", "--page", "A", "--dry-run", "--code", "de",
            "-v",
        ]);
        assert!(cli.dry_run);
        assert_eq!(cli.code.as_deref(), Some("de"));
        assert_eq!(cli.verbose, 1);
        let Some(Commands::AddText(args)) = cli.command else {
            panic!("expected add-text");
        };
        assert!(matches!(args.position, PositionArg::Bottom));
    }

    #[test]
    fn runtime_keeps_global_flags_after_taking_the_command() {
        let temp = std::env::temp_dir().join("wikibot-cli-missing.toml");
        let path = temp.to_string_lossy().to_string();
        let mut cli = Cli::parse_from([
            "wikibot", "--config", path.as_str(), "--family", "wiktionary", "--json", "whoami",
        ]);
        assert!(matches!(cli.command.take(), Some(Commands::Whoami)));
        let runtime = load_runtime(&cli).expect("runtime");
        assert_eq!(runtime.config_path, temp);
        assert_eq!(runtime.config.family(), "wiktionary");
        assert!(runtime.json);
        assert!(!runtime.dry_run);
    }

    #[test]
    fn ignore_warnings_accepts_bare_flag() {
        let cli = Cli::parse_from(["wikibot", "upload", "a.png", "--ignore-warnings"]);
        let Some(Commands::Upload(args)) = cli.command else {
            panic!("expected upload");
        };
        assert_eq!(args.ignore_warnings, Some(Vec::new()));
    }
}
