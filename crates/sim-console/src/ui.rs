use std::io::{self, Stdout};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::mpsc::{self, Receiver, Sender};
use std::time::Duration;

use crossterm::cursor::{Hide, Show};
use crossterm::event::{self, Event, KeyCode, KeyEventKind, KeyModifiers};
use crossterm::execute;
use crossterm::terminal::{
    EnterAlternateScreen, LeaveAlternateScreen, disable_raw_mode, enable_raw_mode,
};
use ratatui::Terminal;
use ratatui::backend::CrosstermBackend;
use ratatui::buffer::Buffer;
use ratatui::layout::{Constraint, Direction, Layout, Rect};
use ratatui::style::{Color, Modifier, Style};
use ratatui::symbols::Marker;
use ratatui::text::{Line, Span, Text};
use ratatui::widgets::{
    Axis, Block, BorderType, Borders, Chart, Clear, Dataset, GraphType, List, ListItem, ListState,
    Paragraph, Widget, Wrap,
};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::api::{SimulationApi, SubmitOutcome};
use crate::error::{Error, Result};
use crate::form::{FormModel, LoadedForm, PendingEdit, Prepared};
use crate::generation::{
    average_fitness_series, average_money_series, best_bot, day_label, purchase_history,
};
use crate::poll::{PollEvent, PollEventKind, PollHandle, PollOptions, PollSink, start_polling};
use crate::run::{RunController, RunPhase};
use crate::sanitize::sanitize_text;
use crate::schema::{FormEntry, LeafType};
use crate::validation::ValidationError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Screen {
    Settings,
    Run,
}

/// Results coming back from worker threads and the poller.
enum UiEvent {
    Loaded {
        seq: u64,
        result: Result<LoadedForm>,
    },
    Validated {
        edit: PendingEdit,
        result: Result<Vec<ValidationError>>,
    },
    Saved {
        key: String,
        result: Result<Vec<String>>,
    },
    Submitted {
        epoch: u64,
        outcome: Result<SubmitOutcome>,
    },
    Poll(PollEvent),
}

struct UiSink {
    tx: Sender<UiEvent>,
}

impl PollSink for UiSink {
    fn emit(&self, ev: PollEvent) {
        let _ = self.tx.send(UiEvent::Poll(ev));
    }
}

#[derive(Debug, Clone)]
enum InputMode {
    Normal,
    EditField {
        path: String,
        label: String,
        leaf: LeafType,
        buffer: String,
    },
    SaveAs {
        buffer: String,
        error: Option<String>,
    },
    PickConfig {
        list: ListState,
    },
}

struct App {
    api: Arc<dyn SimulationApi>,
    poll_opts: PollOptions,
    tx: Sender<UiEvent>,
    rx: Receiver<UiEvent>,

    screen: Screen,
    form: Option<FormModel>,
    field_list: ListState,
    load_seq: u64,
    loading: bool,
    validating: usize,

    controller: RunController,
    poller: Option<PollHandle>,

    notice: Option<(String, Color)>,
    input: InputMode,
}

impl App {
    fn new(api: Arc<dyn SimulationApi>, poll_opts: PollOptions) -> Self {
        let (tx, rx) = mpsc::channel();
        Self {
            api,
            poll_opts,
            tx,
            rx,
            screen: Screen::Settings,
            form: None,
            field_list: ListState::default(),
            load_seq: 0,
            loading: false,
            validating: 0,
            controller: RunController::new(),
            poller: None,
            notice: None,
            input: InputMode::Normal,
        }
    }

    fn spawn<F>(&self, job: F)
    where
        F: FnOnce(&dyn SimulationApi) -> UiEvent + Send + 'static,
    {
        let api = Arc::clone(&self.api);
        let tx = self.tx.clone();
        std::thread::spawn(move || {
            let _ = tx.send(job(api.as_ref()));
        });
    }

    fn notify(&mut self, msg: impl AsRef<str>, color: Color) {
        self.notice = Some((sanitize_text(msg.as_ref()), color));
    }

    fn start_load(&mut self, name: Option<String>) {
        self.load_seq += 1;
        self.loading = true;
        let seq = self.load_seq;
        self.spawn(move |api| UiEvent::Loaded {
            seq,
            result: match name {
                Some(n) => LoadedForm::fetch_named(api, &n),
                None => LoadedForm::fetch_default(api),
            },
        });
    }

    fn entries(&self) -> &[FormEntry] {
        self.form.as_ref().map(FormModel::entries).unwrap_or_default()
    }

    fn selected_entry(&self) -> Option<&FormEntry> {
        let idx = self.field_list.selected()?;
        self.entries().get(idx)
    }

    fn select_first_field(&mut self) {
        let first = self.entries().iter().position(|e| e.as_field().is_some());
        self.field_list.select(first.or(Some(0)));
    }

    fn select_next_entry(&mut self) {
        let n = self.entries().len();
        if n == 0 {
            return;
        }
        let i = self.field_list.selected().unwrap_or(0);
        self.field_list.select(Some((i + 1).min(n - 1)));
    }

    fn select_prev_entry(&mut self) {
        if self.entries().is_empty() {
            return;
        }
        let i = self.field_list.selected().unwrap_or(0);
        self.field_list.select(Some(i.saturating_sub(1)));
    }

    fn begin_edit_field(&mut self) {
        let Some(form) = self.form.as_ref() else {
            return;
        };
        let Some(field) = self.selected_entry().and_then(FormEntry::as_field) else {
            return;
        };
        self.input = InputMode::EditField {
            path: field.path.clone(),
            label: sanitize_text(&field.label),
            leaf: field.leaf,
            buffer: form.display_value(&field.path),
        };
    }

    fn apply_edit_field(&mut self) {
        let InputMode::EditField {
            path, leaf, buffer, ..
        } = std::mem::replace(&mut self.input, InputMode::Normal)
        else {
            return;
        };
        let Some(form) = self.form.as_mut() else {
            return;
        };
        match form.prepare_edit(&path, &buffer, leaf) {
            Ok(Prepared::Rejected(why)) => {
                debug!(%path, ?why, "edit dropped");
            }
            Ok(Prepared::Ready(edit)) => {
                self.validating += 1;
                self.spawn(move |api| {
                    let result = api.validate(&edit.config);
                    UiEvent::Validated { edit, result }
                });
            }
            Err(e) => {
                warn!(%path, error = %e, "edit refused");
                self.notify(e.to_string(), Color::Red);
            }
        }
    }

    fn begin_save(&mut self) {
        let Some(form) = self.form.as_ref() else {
            return;
        };
        self.input = InputMode::SaveAs {
            buffer: form.option_name().to_string(),
            error: None,
        };
    }

    fn apply_save(&mut self) {
        let InputMode::SaveAs { buffer, .. } = &self.input else {
            return;
        };
        let buffer = buffer.clone();
        let Some(form) = self.form.as_mut() else {
            return;
        };
        form.set_option_name(buffer.clone());
        match form.prepare_save(&buffer) {
            Err(e) => {
                self.input = InputMode::SaveAs {
                    buffer,
                    error: Some(e.to_string()),
                };
            }
            Ok((key, config)) => {
                self.input = InputMode::Normal;
                self.notify(format!("saving {key}..."), Color::Yellow);
                self.spawn(move |api| {
                    let result = FormModel::persist(api, &key, &config);
                    UiEvent::Saved { key, result }
                });
            }
        }
    }

    fn begin_pick_config(&mut self) {
        let Some(form) = self.form.as_ref() else {
            return;
        };
        let mut list = ListState::default();
        let current = form
            .selected()
            .and_then(|s| form.options().iter().position(|o| o == s));
        list.select(current.or(Some(0)));
        self.input = InputMode::PickConfig { list };
    }

    fn apply_pick_config(&mut self) {
        let InputMode::PickConfig { list } = &self.input else {
            return;
        };
        let picked = list
            .selected()
            .and_then(|i| self.form.as_ref()?.options().get(i).cloned());
        self.input = InputMode::Normal;
        if let Some(opt) = picked {
            self.start_load(Some(opt.value));
        }
    }

    fn start_run(&mut self) {
        let epoch = match self.controller.begin_submit() {
            Ok(e) => e,
            Err(e) => {
                self.notify(e.to_string(), Color::Red);
                return;
            }
        };
        if let Some(old) = self.poller.take() {
            old.cancel();
        }
        let config: Option<Arc<Value>> = self.form.as_ref().map(FormModel::config);
        info!(epoch, with_config = config.is_some(), "submitting run");
        self.spawn(move |api| UiEvent::Submitted {
            epoch,
            outcome: api.start_run(config.as_deref()),
        });
        self.screen = Screen::Run;
        self.notice = None;
    }

    fn stop_polling(&mut self) {
        if let Some(p) = self.poller.take() {
            p.cancel();
        }
        self.controller.abandon();
    }

    fn drain_events(&mut self) {
        let events: Vec<UiEvent> = self.rx.try_iter().collect();
        for ev in events {
            match ev {
                UiEvent::Loaded { seq, result } => {
                    if seq != self.load_seq {
                        debug!(seq, latest = self.load_seq, "dropping stale load");
                        continue;
                    }
                    self.loading = false;
                    match result {
                        Ok(loaded) => {
                            let label = loaded.selected.clone();
                            let applied = if let Some(form) = self.form.as_mut() {
                                form.apply_loaded(loaded)
                            } else {
                                FormModel::from_loaded(loaded).map(|form| self.form = Some(form))
                            };
                            match applied {
                                Ok(()) => {
                                    self.select_first_field();
                                    self.notify(format!("loaded {label}"), Color::Green);
                                }
                                Err(e) => {
                                    warn!(config = %label, error = %e, "loaded form rejected");
                                    self.notify(
                                        format!("failed to load {label}: {e}"),
                                        Color::Red,
                                    );
                                }
                            }
                        }
                        Err(e) => {
                            warn!(error = %e, "load failed");
                            self.notify(e.to_string(), Color::Red);
                        }
                    }
                }
                UiEvent::Validated { edit, result } => {
                    self.validating = self.validating.saturating_sub(1);
                    let Some(form) = self.form.as_mut() else {
                        continue;
                    };
                    match result {
                        Ok(errors) => {
                            form.commit_edit(edit, errors);
                        }
                        Err(e) => {
                            form.abandon_edit(&edit);
                            warn!(error = %e, "validation failed");
                            self.notify(e.to_string(), Color::Red);
                        }
                    }
                }
                UiEvent::Saved { key, result } => match result {
                    Ok(names) => {
                        if let Some(form) = self.form.as_mut() {
                            form.apply_saved(&key, &names);
                        }
                        self.notify(format!("saved {key}"), Color::Green);
                    }
                    Err(e) => self.notify(e.to_string(), Color::Red),
                },
                UiEvent::Submitted { epoch, outcome } => {
                    let phase = self.controller.finish_submit(epoch, outcome).clone();
                    match phase {
                        RunPhase::Running => {
                            if let Some(run) = self.controller.run() {
                                let sink = Arc::new(UiSink {
                                    tx: self.tx.clone(),
                                });
                                self.poller = Some(start_polling(
                                    Arc::clone(&self.api),
                                    run.id.clone(),
                                    epoch,
                                    self.poll_opts.clone(),
                                    sink,
                                ));
                            }
                        }
                        RunPhase::Rejected(msg) => self.notify(msg, Color::Red),
                        _ => {}
                    }
                }
                UiEvent::Poll(ev) => {
                    if let PollEventKind::TickFailed { error, consecutive } = &ev.kind
                        && self.poller.as_ref().is_some_and(|p| p.epoch() == ev.epoch)
                    {
                        self.notify(
                            format!("poll failed ({consecutive} in a row): {error}"),
                            Color::Yellow,
                        );
                    }
                    self.controller.apply(&ev);
                    if !self.controller.phase().is_running() {
                        self.poller = None;
                    }
                }
            }
        }
    }

    fn handle_key(&mut self, code: KeyCode, mods: KeyModifiers) -> bool {
        if mods.contains(KeyModifiers::CONTROL) && matches!(code, KeyCode::Char('c')) {
            return true;
        }

        match &mut self.input {
            InputMode::EditField { buffer, .. } | InputMode::SaveAs { buffer, .. } => {
                match code {
                    KeyCode::Esc => self.input = InputMode::Normal,
                    KeyCode::Enter => match self.input {
                        InputMode::EditField { .. } => self.apply_edit_field(),
                        InputMode::SaveAs { .. } => self.apply_save(),
                        _ => {}
                    },
                    KeyCode::Backspace => {
                        buffer.pop();
                    }
                    KeyCode::Char(c) if c != '\n' && c != '\r' => buffer.push(c),
                    _ => {}
                }
                return false;
            }
            InputMode::PickConfig { list } => {
                let n = self.form.as_ref().map_or(0, |f| f.options().len());
                match code {
                    KeyCode::Esc => self.input = InputMode::Normal,
                    KeyCode::Enter => self.apply_pick_config(),
                    KeyCode::Down | KeyCode::Char('j') if n > 0 => {
                        let i = list.selected().unwrap_or(0);
                        list.select(Some((i + 1).min(n - 1)));
                    }
                    KeyCode::Up | KeyCode::Char('k') => {
                        let i = list.selected().unwrap_or(0);
                        list.select(Some(i.saturating_sub(1)));
                    }
                    _ => {}
                }
                return false;
            }
            InputMode::Normal => {}
        }

        match self.screen {
            Screen::Settings => match code {
                KeyCode::Char('q') | KeyCode::Esc => return true,
                KeyCode::Down | KeyCode::Char('j') => self.select_next_entry(),
                KeyCode::Up | KeyCode::Char('k') => self.select_prev_entry(),
                KeyCode::Enter | KeyCode::Char('e') => self.begin_edit_field(),
                KeyCode::Char('o') => self.begin_pick_config(),
                KeyCode::Char('s') => self.begin_save(),
                KeyCode::Char('r') => self.start_run(),
                KeyCode::Char('g') => self.screen = Screen::Run,
                KeyCode::Char('R') => self.start_load(None),
                _ => {}
            },
            Screen::Run => match code {
                KeyCode::Char('q') => return true,
                KeyCode::Esc | KeyCode::Char('b') => self.screen = Screen::Settings,
                KeyCode::Char('r') => self.start_run(),
                KeyCode::Char('c') => {
                    self.stop_polling();
                    self.notify("polling stopped", Color::Yellow);
                }
                _ => {}
            },
        }
        false
    }

    fn draw(&mut self, f: &mut ratatui::Frame) {
        let chunks = Layout::default()
            .direction(Direction::Vertical)
            .constraints([
                Constraint::Length(2),
                Constraint::Min(0),
                Constraint::Length(2),
            ])
            .split(f.area());

        self.draw_header(f, chunks[0]);
        match self.screen {
            Screen::Settings => self.draw_settings(f, chunks[1]),
            Screen::Run => self.draw_run(f, chunks[1]),
        }
        self.draw_footer(f, chunks[2]);
        self.draw_modal(f);
    }

    fn draw_header(&self, f: &mut ratatui::Frame, area: Rect) {
        let now = chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string();
        let title = match self.screen {
            Screen::Settings => "Simulation: Settings",
            Screen::Run => "Simulation: Run",
        };
        let config = self
            .form
            .as_ref()
            .and_then(FormModel::selected)
            .map(|o| sanitize_text(&o.label))
            .unwrap_or_else(|| "<none>".into());
        let mut spans = vec![
            Span::styled(title, Style::default().fg(Color::Cyan)),
            Span::raw("  "),
            Span::styled(config, Style::default().fg(Color::Gray)),
            Span::raw("  "),
            Span::styled(
                self.controller.phase().label(),
                Style::default().fg(Color::LightBlue),
            ),
            Span::raw("  "),
            Span::styled(now, Style::default().fg(Color::Yellow)),
        ];
        if self.loading || self.validating > 0 {
            spans.push(Span::styled("  busy", Style::default().fg(Color::Magenta)));
        }
        let p = Paragraph::new(Text::from(Line::from(spans))).block(
            Block::default()
                .borders(Borders::BOTTOM)
                .border_type(BorderType::Plain),
        );
        f.render_widget(p, area);
    }

    fn draw_footer(&self, f: &mut ratatui::Frame, area: Rect) {
        let line = match &self.notice {
            Some((msg, color)) => Line::from(Span::styled(msg.clone(), Style::default().fg(*color))),
            None => Line::from(match self.screen {
                Screen::Settings => {
                    "[j/k] Move  [Enter/e] Edit  [o] Open Config  [s] Save As  [r] Run  [g] Run View  [R] Reload  [q] Quit"
                }
                Screen::Run => "[r] Run Again  [c] Stop Polling  [Esc/b] Settings  [q] Quit",
            }),
        };
        let p = Paragraph::new(line)
            .style(Style::default().fg(Color::Gray))
            .block(Block::default().borders(Borders::TOP));
        f.render_widget(p, area);
    }

    fn draw_settings(&mut self, f: &mut ratatui::Frame, area: Rect) {
        let cols = Layout::default()
            .direction(Direction::Horizontal)
            .constraints([Constraint::Percentage(55), Constraint::Percentage(45)])
            .split(area);

        let Some(form) = self.form.as_ref() else {
            let msg = if self.loading {
                "loading configuration..."
            } else {
                "no configuration loaded  [R] retry"
            };
            f.render_widget(
                Paragraph::new(msg).block(Block::default().borders(Borders::ALL).title("Form")),
                area,
            );
            return;
        };

        let items: Vec<ListItem> = form
            .entries()
            .iter()
            .map(|entry| {
                let indent = "  ".repeat(entry.level());
                match entry {
                    FormEntry::Heading { label, .. } => ListItem::new(Line::from(Span::styled(
                        format!("{indent}{}", sanitize_text(label)),
                        Style::default()
                            .fg(Color::Cyan)
                            .add_modifier(Modifier::BOLD),
                    ))),
                    FormEntry::Field(field) => {
                        let errs = form.errors_for(&field.path);
                        let mut lines = vec![Line::from(vec![
                            Span::raw(format!("{indent}{}: ", sanitize_text(&field.label))),
                            Span::styled(
                                form.display_value(&field.path),
                                Style::default().fg(Color::White),
                            ),
                        ])];
                        for e in errs {
                            lines.push(Line::from(Span::styled(
                                format!("{indent}  ! {}", sanitize_text(e)),
                                Style::default().fg(Color::Red),
                            )));
                        }
                        ListItem::new(lines)
                    }
                }
            })
            .collect();

        let list = List::new(items)
            .block(
                Block::default()
                    .title("Form")
                    .borders(Borders::ALL)
                    .border_type(BorderType::Rounded),
            )
            .highlight_style(Style::default().bg(Color::DarkGray))
            .highlight_symbol("> ");

        let detail = self.render_field_detail(form);
        f.render_stateful_widget(list, cols[0], &mut self.field_list);
        f.render_widget(
            Paragraph::new(detail).wrap(Wrap { trim: false }).block(
                Block::default()
                    .title("Field")
                    .borders(Borders::ALL)
                    .border_type(BorderType::Rounded),
            ),
            cols[1],
        );
    }

    fn render_field_detail(&self, form: &FormModel) -> Text<'static> {
        let mut lines = Vec::new();
        match self.selected_entry() {
            Some(FormEntry::Field(field)) => {
                lines.push(Line::from(format!("path:  {}", field.path)));
                lines.push(Line::from(format!("type:  {}", field.leaf)));
                lines.push(Line::from(format!(
                    "value: {}",
                    form.display_value(&field.path)
                )));
                let errs = form.errors_for(&field.path);
                if errs.is_empty() {
                    lines.push(Line::from(Span::styled(
                        "valid",
                        Style::default().fg(Color::Green),
                    )));
                }
                for e in errs {
                    lines.push(Line::from(Span::styled(
                        sanitize_text(e),
                        Style::default().fg(Color::Red),
                    )));
                }
            }
            Some(FormEntry::Heading { path, .. }) => {
                lines.push(Line::from(format!("section {path}")));
            }
            None => {}
        }
        let unclaimed = form.unclaimed_errors();
        if !unclaimed.is_empty() {
            lines.push(Line::from(""));
            lines.push(Line::from(Span::styled(
                "other errors",
                Style::default().fg(Color::Yellow),
            )));
            for (path, msgs) in unclaimed {
                for m in msgs {
                    let path = if path.is_empty() { "<config>" } else { path };
                    lines.push(Line::from(format!("{path}: {}", sanitize_text(m))));
                }
            }
        }
        Text::from(lines)
    }

    fn draw_run(&self, f: &mut ratatui::Frame, area: Rect) {
        let rows = Layout::default()
            .direction(Direction::Vertical)
            .constraints([Constraint::Length(6), Constraint::Min(8)])
            .split(area);
        let lower = Layout::default()
            .direction(Direction::Horizontal)
            .constraints([Constraint::Percentage(60), Constraint::Percentage(40)])
            .split(rows[1]);
        let charts = Layout::default()
            .direction(Direction::Vertical)
            .constraints([
                Constraint::Ratio(1, 3),
                Constraint::Ratio(1, 3),
                Constraint::Ratio(1, 3),
            ])
            .split(lower[0]);

        let generations = self.controller.generations();
        let phase = self.controller.phase();
        let mut summary = vec![Line::from(vec![
            Span::styled("phase: ", Style::default().fg(Color::Yellow)),
            Span::raw(phase.label()),
        ])];
        if let RunPhase::Rejected(msg) | RunPhase::Failed(msg) = phase {
            summary.push(Line::from(Span::styled(
                sanitize_text(msg),
                Style::default().fg(Color::Red),
            )));
        }
        if let Some(run) = self.controller.run() {
            summary.push(Line::from(format!(
                "run: {}  status: {}  generations: {}",
                sanitize_text(run.id.as_str()),
                run.status,
                generations.len()
            )));
        }
        if let Some(latest) = generations.last() {
            summary.push(Line::from(format!(
                "latest avg fitness: {}  avg money: {}",
                fmt_opt(latest.average_fitness()),
                fmt_opt(latest.average_money())
            )));
        }
        f.render_widget(
            Paragraph::new(Text::from(summary)).block(
                Block::default()
                    .title("Run")
                    .borders(Borders::ALL)
                    .border_type(BorderType::Rounded),
            ),
            rows[0],
        );

        let top = best_bot(&generations);
        draw_series_chart(
            f,
            charts[0],
            "Average fitness",
            &average_fitness_series(&generations),
            Color::LightGreen,
            fmt_index,
        );
        draw_series_chart(
            f,
            charts[1],
            "Average money",
            &average_money_series(&generations),
            Color::LightBlue,
            fmt_index,
        );
        draw_series_chart(
            f,
            charts[2],
            "Best bot value",
            &top.map(|b| b.value_series()).unwrap_or_default(),
            Color::LightMagenta,
            fmt_day,
        );

        let mut best = Vec::new();
        match top {
            Some(bot) => {
                best.push(Line::from(format!(
                    "fitness {:.4}  money {:.2}",
                    bot.fitness, bot.money
                )));
                best.push(Line::from(""));
                best.push(Line::from(Span::styled(
                    "month     buy sell  win loss",
                    Style::default().fg(Color::Yellow),
                )));
                for m in purchase_history(bot) {
                    best.push(Line::from(format!(
                        "{:<8} {:>4} {:>4} {:>4} {:>4}",
                        m.month, m.buys, m.sells, m.wins, m.losses
                    )));
                }
            }
            None => best.push(Line::from("no generations yet")),
        }
        f.render_widget(
            Paragraph::new(Text::from(best)).block(
                Block::default()
                    .title("Best bot")
                    .borders(Borders::ALL)
                    .border_type(BorderType::Rounded),
            ),
            lower[1],
        );
    }

    fn draw_modal(&mut self, f: &mut ratatui::Frame) {
        let (title, text, pct) = match &mut self.input {
            InputMode::Normal => return,
            InputMode::EditField {
                path,
                label,
                leaf,
                buffer,
            } => {
                let text = vec![
                    Line::from(vec![
                        Span::styled("Edit: ", Style::default().fg(Color::Yellow)),
                        Span::raw(label.clone()),
                    ]),
                    Line::from(format!("{path} ({leaf})  enter=apply  esc=cancel")),
                    Line::from(""),
                    Line::from(buffer.clone()),
                ];
                ("Edit Field", text, (70, 30))
            }
            InputMode::SaveAs { buffer, error } => {
                let mut text = vec![Line::from("name  enter=save  esc=cancel")];
                if let Some(e) = error {
                    text.push(Line::from(Span::styled(
                        format!("error: {e}"),
                        Style::default().fg(Color::Red),
                    )));
                }
                text.push(Line::from(""));
                text.push(Line::from(buffer.clone()));
                ("Save Config", text, (60, 25))
            }
            InputMode::PickConfig { list } => {
                let area = centered_rect(50, 60, f.area());
                f.render_widget(
                    Fill {
                        style: Style::default()
                            .bg(Color::Black)
                            .add_modifier(Modifier::DIM),
                    },
                    shadow_rect(area, f.area()),
                );
                f.render_widget(Clear, area);
                let items: Vec<ListItem> = self
                    .form
                    .as_ref()
                    .map(|form| {
                        form.options()
                            .iter()
                            .map(|o| ListItem::new(sanitize_text(&o.label)))
                            .collect()
                    })
                    .unwrap_or_default();
                let picker = List::new(items)
                    .style(Style::default().fg(Color::White).bg(Color::DarkGray))
                    .highlight_style(Style::default().add_modifier(Modifier::REVERSED))
                    .block(
                        Block::default()
                            .title("Open Config")
                            .borders(Borders::ALL)
                            .border_type(BorderType::Double),
                    );
                f.render_stateful_widget(picker, area, list);
                return;
            }
        };

        let area = centered_rect(pct.0, pct.1, f.area());
        f.render_widget(
            Fill {
                style: Style::default()
                    .bg(Color::Black)
                    .add_modifier(Modifier::DIM),
            },
            shadow_rect(area, f.area()),
        );
        f.render_widget(Clear, area);
        let p = Paragraph::new(Text::from(text))
            .style(Style::default().fg(Color::White).bg(Color::DarkGray))
            .wrap(Wrap { trim: false })
            .block(
                Block::default()
                    .title(title)
                    .borders(Borders::ALL)
                    .border_type(BorderType::Double),
            );
        f.render_widget(p, area);
    }
}

fn fmt_opt(v: Option<f64>) -> String {
    v.map(|v| format!("{v:.4}")).unwrap_or_else(|| "-".into())
}

fn fmt_index(x: f64) -> String {
    format!("{x:.0}")
}

fn fmt_day(x: f64) -> String {
    day_label(x as i64)
}

fn x_bounds(points: &[(f64, f64)]) -> (f64, f64) {
    let lo = points.first().map_or(0.0, |(x, _)| *x);
    let hi = points.last().map_or(lo, |(x, _)| *x);
    (lo, hi.max(lo + 1.0))
}

fn draw_series_chart(
    f: &mut ratatui::Frame,
    area: Rect,
    title: &str,
    points: &[(f64, f64)],
    color: Color,
    x_label: fn(f64) -> String,
) {
    let (x_min, x_max) = x_bounds(points);
    let (y_min, y_max) = y_bounds(points);
    let dataset = Dataset::default()
        .name(title)
        .marker(Marker::Braille)
        .graph_type(GraphType::Line)
        .style(Style::default().fg(color))
        .data(points);

    let chart = Chart::new(vec![dataset])
        .block(
            Block::default()
                .title(title)
                .borders(Borders::ALL)
                .border_type(BorderType::Rounded),
        )
        .x_axis(
            Axis::default()
                .bounds([x_min, x_max])
                .labels(vec![Span::raw(x_label(x_min)), Span::raw(x_label(x_max))])
                .style(Style::default().fg(Color::DarkGray)),
        )
        .y_axis(
            Axis::default()
                .bounds([y_min, y_max])
                .labels(vec![
                    Span::raw(format!("{y_min:.2}")),
                    Span::raw(format!("{y_max:.2}")),
                ])
                .style(Style::default().fg(Color::DarkGray)),
        );
    f.render_widget(chart, area);
}

fn y_bounds(points: &[(f64, f64)]) -> (f64, f64) {
    let mut lo = f64::INFINITY;
    let mut hi = f64::NEG_INFINITY;
    for (_, y) in points {
        lo = lo.min(*y);
        hi = hi.max(*y);
    }
    if !lo.is_finite() || !hi.is_finite() {
        return (0.0, 1.0);
    }
    if (hi - lo).abs() < f64::EPSILON {
        return (lo - 1.0, hi + 1.0);
    }
    let pad = (hi - lo) * 0.05;
    (lo - pad, hi + pad)
}

pub fn run_tui(api: Arc<dyn SimulationApi>, poll_opts: PollOptions) -> Result<()> {
    let mut stdout = io::stdout();
    enable_raw_mode().map_err(|e| Error::msg(e.to_string()))?;
    execute!(stdout, EnterAlternateScreen, Hide).map_err(|e| Error::msg(e.to_string()))?;
    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend).map_err(|e| Error::msg(e.to_string()))?;
    terminal
        .clear()
        .map_err(|e| Error::msg(format!("tui clear failed: {e}")))?;

    let mut app = App::new(api, poll_opts);
    app.start_load(None);
    let result = run_loop(&mut terminal, &mut app);
    app.stop_polling();

    disable_raw_mode().ok();
    execute!(terminal.backend_mut(), LeaveAlternateScreen, Show).ok();
    result
}

fn run_loop(terminal: &mut Terminal<CrosstermBackend<Stdout>>, app: &mut App) -> Result<()> {
    let tick = Duration::from_millis(100);
    loop {
        app.drain_events();
        let mut draw_panicked = false;
        let draw_result = terminal.draw(|f| {
            if catch_unwind(AssertUnwindSafe(|| app.draw(f))).is_err() {
                draw_panicked = true;
            }
        });
        if draw_panicked {
            app.notify("render failed; redrawing", Color::Red);
            let _ = terminal.clear();
            continue;
        }
        if let Err(e) = draw_result {
            warn!(error = %e, "draw failed");
            let _ = terminal.clear();
            continue;
        }

        if event::poll(tick).map_err(|e| Error::msg(e.to_string()))?
            && let Event::Key(k) = event::read().map_err(|e| Error::msg(e.to_string()))?
            && k.kind == KeyEventKind::Press
            && app.handle_key(k.code, k.modifiers)
        {
            return Ok(());
        }
    }
}

fn centered_rect(percent_x: u16, percent_y: u16, r: Rect) -> Rect {
    let vertical = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Percentage((100 - percent_y) / 2),
            Constraint::Percentage(percent_y),
            Constraint::Percentage((100 - percent_y) / 2),
        ])
        .split(r)[1];
    Layout::default()
        .direction(Direction::Horizontal)
        .constraints([
            Constraint::Percentage((100 - percent_x) / 2),
            Constraint::Percentage(percent_x),
            Constraint::Percentage((100 - percent_x) / 2),
        ])
        .split(vertical)[1]
}

fn shadow_rect(inner: Rect, bounds: Rect) -> Rect {
    let max_x = bounds.x.saturating_add(bounds.width);
    let max_y = bounds.y.saturating_add(bounds.height);
    let x = inner.x.saturating_add(1).min(max_x.saturating_sub(1));
    let y = inner.y.saturating_add(1).min(max_y.saturating_sub(1));
    Rect {
        x,
        y,
        width: inner.width.min(max_x.saturating_sub(x)),
        height: inner.height.min(max_y.saturating_sub(y)),
    }
}

struct Fill {
    style: Style,
}

impl Widget for Fill {
    fn render(self, area: Rect, buf: &mut Buffer) {
        for y in area.y..area.y.saturating_add(area.height) {
            for x in area.x..area.x.saturating_add(area.width) {
                buf[(x, y)].set_char(' ').set_style(self.style);
            }
        }
    }
}
