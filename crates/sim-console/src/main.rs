use clap::{Args as ClapArgs, Parser, Subcommand};
use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, mpsc};

use sim_console::api::{HttpApi, SimulationApi};
use sim_console::form::{EditOutcome, FormModel, LoadedForm, options_from_names};
use sim_console::generation::{average_money_series, best_bot, day_label, purchase_history};
use sim_console::poll::{ChannelSink, PollSink, StdoutSink, start_polling};
use sim_console::run::{RunController, RunPhase};
use sim_console::sanitize::sanitize_text;
use sim_console::schema::FormEntry;
use sim_console::settings::{DEFAULT_SETTINGS_FILE, LogSettings, Settings};
use sim_console::{Error, Result};
use tracing::warn;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    /// Client settings TOML (optional; defaults apply when missing)
    #[arg(long, global = true, default_value = DEFAULT_SETTINGS_FILE)]
    settings: PathBuf,
    /// Simulation service base URL (overrides settings and environment)
    #[arg(long, global = true)]
    base_url: Option<String>,
    /// Emit logs as JSON
    #[arg(long, global = true)]
    log_json: bool,
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Debug, Clone, ClapArgs)]
struct EditArgs {
    /// Start from this named configuration instead of the default
    #[arg(long)]
    config: Option<String>,
    /// Field edit applied through the form, e.g. --set Traits.StopLoss=2.5
    #[arg(long = "set", value_name = "PATH=VALUE")]
    set: Vec<String>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Print the expanded form with current values
    Fields {
        #[arg(long)]
        config: Option<String>,
    },
    /// List named configurations
    Configs,
    /// Apply edits and print the service's validation errors
    Validate {
        #[command(flatten)]
        edits: EditArgs,
    },
    /// Apply edits and save the configuration under NAME
    Save {
        name: String,
        #[command(flatten)]
        edits: EditArgs,
    },
    /// Submit a run and follow its progress until it finishes
    Run {
        #[command(flatten)]
        edits: EditArgs,
        /// Submit without a configuration body (service uses its default)
        #[arg(long)]
        no_body: bool,
    },
    /// Terminal UI (settings form + run monitor)
    Tui,
}

fn main() -> Result<()> {
    dotenv::dotenv().ok();
    let args = Args::parse();
    let settings = Settings::load(&args.settings)?;
    let tui = matches!(args.cmd, Command::Tui);
    init_logging(&settings.log, args.log_json || settings.log.json, tui)?;

    let base_url = settings.base_url(args.base_url.as_deref())?;
    let api: Arc<dyn SimulationApi> = Arc::new(HttpApi::new(&base_url, settings.timeout())?);

    match args.cmd {
        Command::Fields { config } => cmd_fields(api.as_ref(), config.as_deref()),
        Command::Configs => cmd_configs(api.as_ref()),
        Command::Validate { edits } => cmd_validate(api.as_ref(), &edits),
        Command::Save { name, edits } => cmd_save(api.as_ref(), &name, &edits),
        Command::Run { edits, no_body } => cmd_run(api, &settings, &edits, no_body),
        Command::Tui => sim_console::ui::run_tui(api, settings.poll_options()),
    }
}

fn init_logging(log: &LogSettings, json: bool, to_file: bool) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&log.filter))
        .map_err(|e| Error::msg(format!("invalid log filter '{}': {e}", log.filter)))?;
    let builder = tracing_subscriber::fmt().with_env_filter(filter);

    // The TUI owns the terminal, so its logs go to a file.
    if to_file {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log.file)
            .map_err(|e| Error::msg(format!("failed to open log {}: {e}", log.file.display())))?;
        let writer = Mutex::new(file);
        if json {
            builder.json().with_ansi(false).with_writer(writer).init();
        } else {
            builder.with_ansi(false).with_writer(writer).init();
        }
    } else if json {
        builder.json().with_writer(std::io::stderr).init();
    } else {
        builder.with_writer(std::io::stderr).init();
    }
    Ok(())
}

fn load_form(api: &dyn SimulationApi, config: Option<&str>) -> Result<FormModel> {
    let mut form = FormModel::from_loaded(LoadedForm::fetch_default(api)?)?;
    if let Some(name) = config {
        form.load_named(api, name)?;
    }
    Ok(form)
}

fn apply_edits(api: &dyn SimulationApi, form: &mut FormModel, edits: &EditArgs) -> Result<()> {
    for raw in &edits.set {
        let Some((path, value)) = raw.split_once('=') else {
            return Err(Error::msg(format!("--set expects PATH=VALUE, got '{raw}'")));
        };
        let path = path.trim();
        if let EditOutcome::Rejected(why) = form.set_path(api, path, value)? {
            warn!(%path, %why, "edit ignored");
            eprintln!("ignored {path}={value}: {why}");
        }
    }
    Ok(())
}

fn cmd_fields(api: &dyn SimulationApi, config: Option<&str>) -> Result<()> {
    let form = load_form(api, config)?;
    for entry in form.entries() {
        let indent = "  ".repeat(entry.level());
        match entry {
            FormEntry::Heading { label, .. } => println!("{indent}{}", sanitize_text(label)),
            FormEntry::Field(field) => println!(
                "{indent}{:<28} {:<40} {:<16} {}",
                sanitize_text(&field.label),
                field.path,
                field.leaf,
                form.display_value(&field.path)
            ),
        }
    }
    Ok(())
}

fn cmd_configs(api: &dyn SimulationApi) -> Result<()> {
    for opt in options_from_names(&api.list_configs()?) {
        println!(
            "{:<32} {}",
            sanitize_text(&opt.value),
            sanitize_text(&opt.label)
        );
    }
    Ok(())
}

fn cmd_validate(api: &dyn SimulationApi, edits: &EditArgs) -> Result<()> {
    let mut form = load_form(api, edits.config.as_deref())?;
    apply_edits(api, &mut form, edits)?;
    let errors = api.validate(&form.config())?;
    if errors.is_empty() {
        println!("configuration valid");
        return Ok(());
    }
    for e in &errors {
        let path = if e.path.is_empty() { "<config>" } else { &e.path };
        println!("{path}: {}", sanitize_text(&e.message));
    }
    Err(Error::msg(format!(
        "configuration invalid ({} error(s))",
        errors.len()
    )))
}

fn cmd_save(api: &dyn SimulationApi, name: &str, edits: &EditArgs) -> Result<()> {
    let mut form = load_form(api, edits.config.as_deref())?;
    apply_edits(api, &mut form, edits)?;
    form.save(api, name)?;
    if let Some(opt) = form.selected() {
        println!("saved '{}' as {}", opt.label, opt.value);
    }
    Ok(())
}

fn cmd_run(
    api: Arc<dyn SimulationApi>,
    settings: &Settings,
    edits: &EditArgs,
    no_body: bool,
) -> Result<()> {
    if no_body && (edits.config.is_some() || !edits.set.is_empty()) {
        return Err(Error::msg("--no-body cannot be combined with --config or --set"));
    }
    let config = if no_body {
        None
    } else {
        let mut form = load_form(api.as_ref(), edits.config.as_deref())?;
        apply_edits(api.as_ref(), &mut form, edits)?;
        Some(form.config())
    };

    let mut controller = RunController::new();
    let phase = controller.submit(api.as_ref(), config.as_deref())?.clone();
    let run_id = match (phase, controller.run()) {
        (RunPhase::Running, Some(run)) => run.id.clone(),
        (RunPhase::Rejected(msg), _) => return Err(Error::msg(msg)),
        (other, _) => return Err(Error::msg(format!("unexpected phase {}", other.label()))),
    };
    println!("run {run_id} started");

    let (tx, rx) = mpsc::channel();
    let handle = start_polling(
        Arc::clone(&api),
        run_id,
        controller.epoch(),
        settings.poll_options(),
        Arc::new(ChannelSink::new(tx)),
    );
    let printer = StdoutSink::default();
    while controller.phase().is_running() {
        let Ok(ev) = rx.recv() else {
            break;
        };
        printer.emit(ev.clone());
        controller.apply(&ev);
    }
    handle.join();

    match controller.phase() {
        RunPhase::Completed => {
            let generations = controller.generations();
            if let Some(bot) = best_bot(&generations) {
                println!("best bot: fitness {:.4} money {:.2}", bot.fitness, bot.money);
                for m in purchase_history(bot) {
                    println!(
                        "  {} buys={} sells={} wins={} losses={}",
                        m.month, m.buys, m.sells, m.wins, m.losses
                    );
                }
                if !bot.value_history.is_empty() {
                    println!("value history:");
                    for p in &bot.value_history {
                        println!("  {} {:.2}", day_label(p.time), p.value);
                    }
                }
            }
            if let Some((_, money)) = average_money_series(&generations).last() {
                println!("final avg money: {money:.2}");
            }
            Ok(())
        }
        RunPhase::Failed(msg) => Err(Error::msg(sanitize_text(msg))),
        other => Err(Error::msg(format!(
            "polling ended while run was {}",
            other.label()
        ))),
    }
}
