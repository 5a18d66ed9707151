#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use serde_json::{Value, json};
use sim_console::Error;
use sim_console::Result;
use sim_console::api::{GenerationId, RunId, SimulationApi, SubmitOutcome};
use sim_console::generation::Generation;
use sim_console::run::RunStatus;
use sim_console::validation::ValidationError;

pub fn generation_with_fitness(fitness: f64) -> Generation {
    Generation(vec![
        serde_json::from_value(json!({"fitness": fitness, "money": fitness * 100.0}))
            .expect("bot"),
    ])
}

pub fn sample_schema() -> Value {
    json!({
        "Traits": {
            "Label": "Traits",
            "Type": "object",
            "Fields": {
                "StopLoss": {"Label": "Stop Loss", "Type": "float"},
                "Periods": {"Label": "Periods", "Type": "unsigned_integer"},
                "Name": {"Label": "Name", "Type": "text"}
            }
        },
        "Seed": {"Label": "Seed", "Type": "integer"}
    })
}

pub fn sample_config() -> Value {
    json!({
        "Traits": {"StopLoss": 2.5, "Periods": 3, "Name": "base"},
        "Seed": 7
    })
}

pub struct FakeState {
    pub status: RunStatus,
    pub generation_ids: Vec<GenerationId>,
    pub generations: HashMap<String, Generation>,
    pub latency: HashMap<String, Duration>,
    /// Upcoming `run_status` calls that fail.
    pub failing_status_calls: usize,
    /// Upcoming `validate` calls that fail.
    pub failing_validations: usize,
    pub validation: Vec<ValidationError>,
    pub configs: BTreeMap<String, Value>,
    pub start: SubmitOutcome,
}

/// In-memory service with scripted per-generation latency.
pub struct FakeApi {
    pub state: Mutex<FakeState>,
    pub calls: Mutex<Vec<String>>,
    pub completed: Mutex<Vec<String>>,
}

impl FakeApi {
    pub fn new() -> Self {
        let mut configs = BTreeMap::new();
        configs.insert("default".to_string(), sample_config());
        configs.insert(
            "Fast_Run".to_string(),
            json!({"Traits": {"StopLoss": 1.0, "Periods": 1, "Name": "fast"}, "Seed": 1}),
        );
        Self {
            state: Mutex::new(FakeState {
                status: RunStatus::Running,
                generation_ids: Vec::new(),
                generations: HashMap::new(),
                latency: HashMap::new(),
                failing_status_calls: 0,
                failing_validations: 0,
                validation: Vec::new(),
                configs,
                start: SubmitOutcome::Started(RunId::from("run-1")),
            }),
            calls: Mutex::new(Vec::new()),
            completed: Mutex::new(Vec::new()),
        }
    }

    /// Publish generations `0..n`; generation `i` has fitness `i`.
    pub fn publish(&self, n: u64) {
        let mut st = self.state.lock().unwrap();
        for i in st.generation_ids.len() as u64..n {
            st.generation_ids.push(GenerationId::from(i));
            st.generations
                .insert(i.to_string(), generation_with_fitness(i as f64));
        }
    }

    pub fn set_latency(&self, gid: u64, d: Duration) {
        self.state
            .lock()
            .unwrap()
            .latency
            .insert(gid.to_string(), d);
    }

    pub fn set_status(&self, s: RunStatus) {
        self.state.lock().unwrap().status = s;
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_named(&self, prefix: &str) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|c| c.starts_with(prefix))
            .collect()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().unwrap().clear();
        self.completed.lock().unwrap().clear();
    }

    fn record(&self, call: impl Into<String>) {
        self.calls.lock().unwrap().push(call.into());
    }
}

impl SimulationApi for FakeApi {
    fn default_config(&self) -> Result<Value> {
        self.record("default_config");
        self.get_config("default")
    }

    fn form_schema(&self) -> Result<Value> {
        self.record("form_schema");
        Ok(sample_schema())
    }

    fn list_configs(&self) -> Result<Vec<String>> {
        self.record("list_configs");
        Ok(self.state.lock().unwrap().configs.keys().cloned().collect())
    }

    fn get_config(&self, name: &str) -> Result<Value> {
        self.record(format!("get_config:{name}"));
        self.state
            .lock()
            .unwrap()
            .configs
            .get(name)
            .cloned()
            .ok_or_else(|| Error::msg(format!("failed to get config {name}")))
    }

    fn save_config(&self, name: &str, config: &Value) -> Result<()> {
        self.record(format!("save_config:{name}"));
        self.state
            .lock()
            .unwrap()
            .configs
            .insert(name.to_string(), config.clone());
        Ok(())
    }

    fn validate(&self, _config: &Value) -> Result<Vec<ValidationError>> {
        self.record("validate");
        let mut st = self.state.lock().unwrap();
        if st.failing_validations > 0 {
            st.failing_validations -= 1;
            return Err(Error::msg("failed to validate config (status 502)"));
        }
        Ok(st.validation.clone())
    }

    fn start_run(&self, config: Option<&Value>) -> Result<SubmitOutcome> {
        self.record(format!("start_run:{}", config.is_some()));
        Ok(self.state.lock().unwrap().start.clone())
    }

    fn run_status(&self, _id: &RunId) -> Result<RunStatus> {
        self.record("run_status");
        let mut st = self.state.lock().unwrap();
        if st.failing_status_calls > 0 {
            st.failing_status_calls -= 1;
            return Err(Error::msg("failed to get simulation state (status 503)"));
        }
        Ok(st.status)
    }

    fn list_generations(&self, _id: &RunId) -> Result<Vec<GenerationId>> {
        self.record("list_generations");
        Ok(self.state.lock().unwrap().generation_ids.clone())
    }

    fn get_generation(&self, _id: &RunId, gid: &GenerationId) -> Result<Generation> {
        self.record(format!("get_generation:{gid}"));
        let (latency, generation) = {
            let st = self.state.lock().unwrap();
            (
                st.latency.get(gid.as_str()).copied(),
                st.generations.get(gid.as_str()).cloned(),
            )
        };
        if let Some(d) = latency {
            thread::sleep(d);
        }
        self.completed.lock().unwrap().push(gid.to_string());
        generation.ok_or_else(|| Error::msg(format!("failed to get generation {gid}")))
    }
}

#[derive(Debug, Clone)]
pub struct Recorded {
    pub method: String,
    pub path: String,
    pub body: String,
}

pub struct Route {
    pub method: &'static str,
    pub path: &'static str,
    pub status: u16,
    pub body: String,
}

pub fn route(method: &'static str, path: &'static str, status: u16, body: impl Into<String>) -> Route {
    Route {
        method,
        path,
        status,
        body: body.into(),
    }
}

pub struct FakeServer {
    pub base: String,
    pub requests: Arc<Mutex<Vec<Recorded>>>,
}

fn read_request(stream: &mut TcpStream) -> Option<Recorded> {
    let mut data = Vec::new();
    let mut buf = [0u8; 4096];
    let header_end = loop {
        let n = stream.read(&mut buf).ok()?;
        if n == 0 {
            return None;
        }
        data.extend_from_slice(&buf[..n]);
        if let Some(i) = data.windows(4).position(|w| w == b"\r\n\r\n") {
            break i + 4;
        }
    };
    let head = String::from_utf8_lossy(&data[..header_end]).to_string();
    let content_length = head
        .lines()
        .filter_map(|l| l.split_once(':'))
        .find(|(k, _)| k.trim().eq_ignore_ascii_case("content-length"))
        .and_then(|(_, v)| v.trim().parse::<usize>().ok())
        .unwrap_or(0);
    while data.len() < header_end + content_length {
        let n = stream.read(&mut buf).ok()?;
        if n == 0 {
            break;
        }
        data.extend_from_slice(&buf[..n]);
    }
    let mut parts = head.lines().next()?.split_whitespace();
    Some(Recorded {
        method: parts.next()?.to_string(),
        path: parts.next()?.to_string(),
        body: String::from_utf8_lossy(&data[header_end..]).to_string(),
    })
}

fn reason(status: u16) -> &'static str {
    match status {
        200 => "OK",
        400 => "Bad Request",
        404 => "Not Found",
        _ => "Internal Server Error",
    }
}

/// Serve scripted responses until the test process exits.
pub fn serve(routes: Vec<Route>) -> FakeServer {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    let addr = listener.local_addr().expect("addr");
    let requests = Arc::new(Mutex::new(Vec::new()));
    let seen = Arc::clone(&requests);
    thread::spawn(move || {
        for stream in listener.incoming() {
            let Ok(mut stream) = stream else {
                continue;
            };
            let Some(req) = read_request(&mut stream) else {
                continue;
            };
            let (status, body) = routes
                .iter()
                .find(|r| r.method == req.method && r.path == req.path)
                .map(|r| (r.status, r.body.clone()))
                .unwrap_or((404, String::new()));
            seen.lock().unwrap().push(req);
            let hdr = format!(
                "HTTP/1.1 {status} {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                reason(status),
                body.len()
            );
            let _ = stream.write_all(hdr.as_bytes());
            let _ = stream.write_all(body.as_bytes());
        }
    });
    FakeServer {
        base: format!("http://{addr}"),
        requests,
    }
}
