//! Weather assistant on top of the local model.
//!
//! Weather questions are routed to an MCP `query_weather` tool, everything
//! else goes to the local model with a few turns of dialogue context.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Local};
use regex::Regex;
use rmcp::model::CallToolRequestParam;
use rmcp::service::{Peer, RunningService};
use rmcp::transport::TokioChildProcess;
use rmcp::{RoleClient, ServiceExt};
use serde::Serialize;
use std::collections::VecDeque;
use std::io::Write;
use std::path::Path;
use std::sync::{Arc, LazyLock};
use tokio::io::AsyncBufReadExt;
use tokio::sync::Mutex;

use crate::client::ServiceClient;
use crate::openai::{ChatCompletionRequest, Message};

pub const MAX_HISTORY: usize = 5;
pub const WEATHER_TOOL_NAME: &str = "query_weather";

const APOLOGY: &str = "Sorry, an error occurred while processing your request. Please try again later.";

const WEATHER_KEYWORDS: &[&str] = &[
    "weather", "temperature", "humidity", "rain", "snow", "sunny", "cloudy", "wind",
    "天气", "温度", "气温", "湿度", "下雨", "下雪", "晴", "多云", "风力", "雨天",
];

const CITY_MAP: &[(&str, &str)] = &[
    ("北京", "Beijing"),
    ("上海", "Shanghai"),
    ("广州", "Guangzhou"),
    ("深圳", "Shenzhen"),
    ("天津", "Tianjin"),
    ("重庆", "Chongqing"),
    ("成都", "Chengdu"),
    ("杭州", "Hangzhou"),
    ("武汉", "Wuhan"),
    ("西安", "Xi'an"),
    ("苏州", "Suzhou"),
    ("郑州", "Zhengzhou"),
    ("南京", "Nanjing"),
    ("青岛", "Qingdao"),
    ("沈阳", "Shenyang"),
    ("大连", "Dalian"),
    ("厦门", "Xiamen"),
    ("福州", "Fuzhou"),
    ("长沙", "Changsha"),
    ("哈尔滨", "Harbin"),
    ("济南", "Jinan"),
    ("长春", "Changchun"),
    ("石家庄", "Shijiazhuang"),
    ("合肥", "Hefei"),
    ("太原", "Taiyuan"),
    ("南昌", "Nanchang"),
    ("南宁", "Nanning"),
    ("昆明", "Kunming"),
    ("贵阳", "Guiyang"),
    ("海口", "Haikou"),
    ("乌鲁木齐", "Urumqi"),
    ("拉萨", "Lhasa"),
    ("兰州", "Lanzhou"),
    ("宁波", "Ningbo"),
    ("香港", "Hong Kong"),
    ("澳门", "Macau"),
];

const KNOWN_PLACES: &[&str] = &[
    "Hebei", "Shanxi", "Liaoning", "Jilin", "Heilongjiang", "Jiangsu", "Zhejiang", "Anhui",
    "Fujian", "Jiangxi", "Shandong", "Henan", "Hubei", "Hunan", "Guangdong", "Hainan",
    "Sichuan", "Guizhou", "Yunnan", "Shaanxi", "Gansu", "Qinghai", "Guangxi", "Xinjiang",
];

static FILLER_WORDS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b(?:you|please|know)\b").expect("valid regex"));

static POSSESSIVE_WEATHER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"([A-Z][a-z]+(?:\s[A-Z][a-z]+)*)(?:'s| now| today)\s+weather").expect("valid regex")
});

static WEATHER_IN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\bweather\s+(?:like\s+)?in\s+([a-z][a-z' ]*?)(?:\s+(?:now|today|tomorrow))?\s*(?:[?.!,]|$)")
        .expect("valid regex")
});

static KNOWN_PLACE: LazyLock<Regex> = LazyLock::new(|| {
    let names: Vec<String> = CITY_MAP
        .iter()
        .map(|(_, en)| *en)
        .chain(KNOWN_PLACES.iter().copied())
        .map(regex::escape)
        .collect();
    Regex::new(&format!(r"(?i)\b({})\b", names.join("|"))).expect("valid regex")
});

static CHINESE_WEATHER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(.+?)(?:现在|今天|的)天气").expect("valid regex"));

static DECLINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b(?:no|none|not needed)\b|否|不需要").expect("valid regex"));

static DECISION_CITY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)city\s*[:：]\s*([^\s,.;]+)").expect("valid regex"));

#[derive(Debug, Clone, Serialize)]
pub struct DialogueTurn {
    pub role: String,
    pub content: String,
    pub timestamp: DateTime<Local>,
}

/// The most recent dialogue turns, oldest dropped first.
#[derive(Debug, Clone)]
pub struct DialogueMemory {
    history: VecDeque<DialogueTurn>,
    max_len: usize,
}

impl Default for DialogueMemory {
    fn default() -> Self {
        Self::with_capacity(MAX_HISTORY)
    }
}

impl DialogueMemory {
    pub fn with_capacity(max_len: usize) -> Self {
        Self {
            history: VecDeque::with_capacity(max_len),
            max_len,
        }
    }

    pub fn add_message(&mut self, role: &str, content: &str) {
        self.history.push_back(DialogueTurn {
            role: role.to_string(),
            content: content.to_string(),
            timestamp: Local::now(),
        });
        while self.history.len() > self.max_len {
            self.history.pop_front();
        }
    }

    /// Remembered turns as `User: ...` / `Assistant: ...` blocks, oldest first.
    pub fn recent_context(&self) -> String {
        self.history
            .iter()
            .filter_map(|turn| match turn.role.as_str() {
                "user" => Some(format!("User: {}", turn.content)),
                "assistant" => Some(format!("Assistant: {}", turn.content)),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n\n")
    }

    pub fn turns(&self) -> impl Iterator<Item = &DialogueTurn> {
        self.history.iter()
    }

    pub fn len(&self) -> usize {
        self.history.len()
    }

    pub fn is_empty(&self) -> bool {
        self.history.is_empty()
    }

    pub fn clear(&mut self) {
        self.history.clear();
    }
}

pub fn is_weather_query(query: &str) -> bool {
    let lower = query.to_lowercase();
    WEATHER_KEYWORDS.iter().any(|k| lower.contains(k))
}

/// Pulls a place name out of a weather question, trying the phrasings people
/// actually use before falling back to a list of known places.
pub fn extract_city(query: &str) -> Option<String> {
    let cleaned = FILLER_WORDS.replace_all(query, "");
    let cleaned = cleaned.trim();

    if let Some(caps) = POSSESSIVE_WEATHER.captures(cleaned) {
        return Some(caps[1].trim().to_string());
    }

    if let Some(caps) = WEATHER_IN.captures(cleaned) {
        let city = caps[1].trim();
        if !city.is_empty() {
            return Some(title_case(city));
        }
    }

    if let Some(m) = KNOWN_PLACE.find(cleaned) {
        return Some(title_case(m.as_str()));
    }

    if let Some(caps) = CHINESE_WEATHER.captures(cleaned) {
        let city = caps[1].trim().trim_start_matches("请问").trim();
        if !city.is_empty() {
            return Some(city.to_string());
        }
    }

    // A bare Chinese city name anywhere in the query
    CITY_MAP
        .iter()
        .find(|(zh, _)| cleaned.contains(zh))
        .map(|(zh, _)| zh.to_string())
}

fn title_case(s: &str) -> String {
    s.split_whitespace()
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars.flat_map(|c| c.to_lowercase())).collect(),
                None => String::new(),
            }
        })
        .collect::<Vec<String>>()
        .join(" ")
}

/// Chinese place name → the English name the weather API expects.
/// Unknown names pass through unchanged.
pub fn translate_city(city: &str) -> String {
    if let Some((_, en)) = CITY_MAP.iter().find(|(zh, _)| *zh == city) {
        return en.to_string();
    }
    // "北京市" → "北京"
    if let Some((_, en)) = CITY_MAP
        .iter()
        .find(|(zh, _)| city.starts_with(zh) || city.contains(zh))
    {
        return en.to_string();
    }
    city.to_string()
}

/// One observation as returned by the OpenWeather current-weather API.
#[derive(Debug, Clone, PartialEq)]
pub struct Observation {
    pub city: String,
    pub country: Option<String>,
    pub temperature: f64,
    pub humidity: f64,
    pub wind_speed: f64,
    pub description: String,
    /// Air quality index, when the tool merges one in under `air_quality.aqi`.
    pub aqi: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum WeatherReport {
    Observed(Observation),
    /// The tool already formatted its answer.
    Text(String),
}

/// Interprets raw tool output. JSON carrying an `error` field is an error;
/// anything that is not a full observation is passed through as text.
pub fn parse_weather(raw: &str) -> Result<WeatherReport> {
    let raw = raw.trim();
    if raw.is_empty() {
        anyhow::bail!("Weather tool returned an empty result");
    }

    let value: serde_json::Value = match serde_json::from_str(raw) {
        Ok(v) => v,
        Err(_) => return Ok(WeatherReport::Text(raw.to_string())),
    };

    if let Some(error) = value.get("error") {
        let msg = error.as_str().map(str::to_string).unwrap_or_else(|| error.to_string());
        anyhow::bail!("Weather API error: {}", msg);
    }

    let main = value.get("main");
    let observation = (|| {
        Some(Observation {
            city: value.get("name")?.as_str()?.to_string(),
            country: value
                .get("sys")
                .and_then(|s| s.get("country"))
                .and_then(|c| c.as_str())
                .map(str::to_string),
            temperature: main?.get("temp")?.as_f64()?,
            humidity: main?.get("humidity")?.as_f64()?,
            wind_speed: value.get("wind")?.get("speed")?.as_f64()?,
            description: value
                .get("weather")
                .and_then(|w| w.get(0))
                .and_then(|w| w.get("description"))
                .and_then(|d| d.as_str())
                .unwrap_or("unknown")
                .to_string(),
            aqi: value
                .get("air_quality")
                .and_then(|a| a.get("aqi"))
                .and_then(|a| a.as_f64()),
        })
    })();

    Ok(match observation {
        Some(obs) => WeatherReport::Observed(obs),
        None => WeatherReport::Text(raw.to_string()),
    })
}

impl WeatherReport {
    pub fn render(&self) -> String {
        match self {
            WeatherReport::Text(text) => text.clone(),
            WeatherReport::Observed(obs) => format!(
                "🌍 Current weather in {}:\n🌡 Temperature: {}°C\n🌤 Weather: {}\n💧 Humidity: {}%\n🌬 Wind speed: {} m/s",
                obs.city, obs.temperature, obs.description, obs.humidity, obs.wind_speed
            ),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Suitability {
    Suitable,
    NotVerySuitable,
    NotSuitable,
}

impl Suitability {
    fn label(self) -> &'static str {
        match self {
            Suitability::Suitable => "suitable",
            Suitability::NotVerySuitable => "not very suitable",
            Suitability::NotSuitable => "not suitable",
        }
    }
}

/// Verdict on going outside plus the reasons that lowered it. The worst
/// single factor decides the verdict.
pub fn assess_suitability(obs: &Observation) -> (Suitability, Vec<&'static str>) {
    let mut verdict = Suitability::Suitable;
    let mut reasons = Vec::new();
    let mut lower = |level: Suitability, reason: &'static str| {
        verdict = verdict.max(level);
        reasons.push(reason);
    };

    if obs.temperature > 35.0 {
        lower(Suitability::NotSuitable, "extremely high temperature");
    } else if obs.temperature > 30.0 {
        lower(Suitability::NotVerySuitable, "high temperature");
    } else if obs.temperature < -5.0 {
        lower(Suitability::NotSuitable, "extremely low temperature");
    } else if obs.temperature < 5.0 {
        lower(Suitability::NotVerySuitable, "low temperature");
    }

    let description = obs.description.to_lowercase();
    if ["rain", "thunderstorm", "drizzle", "snow", "shower"]
        .iter()
        .any(|k| description.contains(k))
    {
        lower(Suitability::NotVerySuitable, "precipitation");
    }

    if obs.wind_speed > 15.0 {
        lower(Suitability::NotSuitable, "very strong wind");
    } else if obs.wind_speed > 10.0 {
        lower(Suitability::NotVerySuitable, "strong wind");
    }

    match obs.aqi {
        Some(aqi) if aqi > 200.0 => lower(Suitability::NotSuitable, "bad air quality"),
        Some(aqi) if aqi > 150.0 => lower(Suitability::NotVerySuitable, "poor air quality"),
        _ => {}
    }

    (verdict, reasons)
}

pub fn render_suitability(obs: &Observation) -> String {
    let (verdict, reasons) = assess_suitability(obs);
    let mut out = format!(
        "Based on current weather in {}:\n- Temperature: {}°C\n- Weather: {}\n- Humidity: {}%\n- Wind speed: {} m/s\n\n",
        obs.city, obs.temperature, obs.description, obs.humidity, obs.wind_speed
    );
    if verdict == Suitability::Suitable {
        out.push_str("✅ The current weather is good, **suitable for outdoor activities**.");
    } else {
        out.push_str(&format!(
            "⚠️ The current weather has {}, **{} for going out**. Adjust plans based on actual conditions.",
            reasons.join(", "),
            verdict.label()
        ));
    }
    out
}

fn wants_outdoor_advice(query: &str) -> bool {
    let lower = query.to_lowercase();
    ["go out", "outdoor", "出门", "户外"].iter().any(|k| lower.contains(k))
}

#[async_trait]
pub trait WeatherTool: Send + Sync {
    /// Raw tool output for `city` (English name).
    async fn query_weather(&self, city: &str) -> Result<String>;
}

/// `query_weather` served by an MCP server script run as a child process.
pub struct McpWeatherTool {
    peer: Peer<RoleClient>,
    service: Mutex<Option<RunningService<RoleClient, ()>>>,
    available: bool,
}

impl McpWeatherTool {
    /// Launches `script` (`python` for `.py`, `node` for `.js`) and opens an
    /// MCP session over its stdio.
    pub async fn connect(script: &Path) -> Result<Self> {
        let program = server_program(script)?;
        let mut command = tokio::process::Command::new(program);
        command.arg(script);

        tracing::info!(program, script = %script.display(), "Starting MCP weather server");
        let transport = TokioChildProcess::new(command)
            .with_context(|| format!("Failed to start MCP server {}", script.display()))?;
        let service = ().serve(transport).await.context("MCP handshake failed")?;

        let tools = service.list_all_tools().await.context("Failed to list MCP tools")?;
        let names: Vec<String> = tools.iter().map(|t| t.name.to_string()).collect();
        let available = names.iter().any(|n| n == WEATHER_TOOL_NAME);
        tracing::info!(tools = ?names, available, "Connected to MCP server");

        Ok(Self {
            peer: service.peer().clone(),
            service: Mutex::new(Some(service)),
            available,
        })
    }

    pub fn is_available(&self) -> bool {
        self.available
    }

    pub async fn close(&self) -> Result<()> {
        if let Some(service) = self.service.lock().await.take() {
            service.cancel().await.context("Failed to stop MCP session")?;
        }
        Ok(())
    }
}

fn server_program(script: &Path) -> Result<&'static str> {
    match script.extension().and_then(|e| e.to_str()) {
        Some("py") => Ok("python"),
        Some("js") => Ok("node"),
        _ => anyhow::bail!("Server script must be a .py or .js file: {}", script.display()),
    }
}

#[async_trait]
impl WeatherTool for McpWeatherTool {
    async fn query_weather(&self, city: &str) -> Result<String> {
        if !self.available {
            anyhow::bail!("MCP server does not provide `{}`", WEATHER_TOOL_NAME);
        }

        let arguments = serde_json::json!({ "city": city }).as_object().cloned();
        let result = self
            .peer
            .call_tool(CallToolRequestParam {
                name: WEATHER_TOOL_NAME.into(),
                arguments,
            })
            .await
            .context("Weather tool call failed")?;

        let text: Vec<String> = result
            .content
            .iter()
            .filter_map(|c| c.as_text().map(|t| t.text.clone()))
            .collect();
        if result.is_error == Some(true) {
            anyhow::bail!("Weather tool reported an error: {}", text.join("\n"));
        }
        Ok(text.join("\n"))
    }
}

/// Routes each query to the weather tool or the local model and keeps the
/// dialogue memory current.
pub struct Assistant {
    client: ServiceClient,
    tool: Arc<dyn WeatherTool>,
    memory: DialogueMemory,
}

impl Assistant {
    pub fn new(client: ServiceClient, tool: Arc<dyn WeatherTool>) -> Self {
        Self {
            client,
            tool,
            memory: DialogueMemory::default(),
        }
    }

    pub fn memory(&self) -> &DialogueMemory {
        &self.memory
    }

    /// Answers one query. Never fails: errors become an apology, and both the
    /// query and the reply are remembered.
    pub async fn process_query(&mut self, query: &str) -> String {
        self.memory.add_message("user", query);

        let reply = match self.answer(query).await {
            Ok(reply) => reply,
            Err(e) => {
                tracing::error!(error = %e, "Failed to answer query");
                APOLOGY.to_string()
            }
        };

        self.memory.add_message("assistant", &reply);
        reply
    }

    async fn answer(&self, query: &str) -> Result<String> {
        let Some(city) = self.weather_city(query).await else {
            return self.local_model_response(query).await;
        };

        let translated = translate_city(&city);
        tracing::info!(city = %city, translated = %translated, "Calling weather tool");

        let report = match self.tool.query_weather(&translated).await.and_then(|raw| parse_weather(&raw)) {
            Ok(report) => report,
            Err(e) => {
                tracing::warn!(error = %e, city = %translated, "Weather lookup failed");
                return Ok(format!(
                    "Sorry, I can't get weather information for {} right now. You can check weather apps later for updated information.",
                    city
                ));
            }
        };

        if let WeatherReport::Observed(obs) = &report {
            if wants_outdoor_advice(query) {
                return Ok(render_suitability(obs));
            }
        }
        Ok(report.render())
    }

    /// City to look up, or `None` when the query should go to the model.
    async fn weather_city(&self, query: &str) -> Option<String> {
        if is_weather_query(query) {
            return extract_city(query);
        }

        let context = self.memory.recent_context();
        let system_prompt = format!(
            "You are an assistant helping to judge user intent. Determine whether the user is asking for weather information.\n\
             Answer \"yes\" or \"no\". If yes, add the city as `city: <name>`.\n\
             Prefer real-time tool data over built-in knowledge when the intent is clearly about weather.\n\n\
             Current dialogue context:\n{}",
            if context.is_empty() { "None" } else { context.as_str() }
        );

        let request = ChatCompletionRequest::new(
            self.client.config().model.clone(),
            vec![Message::system(system_prompt), Message::user(query)],
        )
        .with_temperature(0.0)
        .with_max_tokens(50);

        let decision = match self.client.chat_completion(&request).await {
            Ok(resp) => resp.first_content().unwrap_or_default(),
            Err(e) => {
                tracing::warn!(error = %e, "Intent decision failed, answering without tool");
                return None;
            }
        };
        tracing::debug!(decision = %decision.trim(), "Intent decision");
        parse_decision(&decision, query)
    }

    async fn local_model_response(&self, query: &str) -> Result<String> {
        let context = self.memory.recent_context();
        let system_prompt = format!(
            "You are a friendly AI assistant capable of understanding context and providing helpful responses.\n\
             Current dialogue context:\n{}\n\nUser question:\n{}\n\n\
             Please provide a natural and helpful response based on the context and user question.",
            if context.is_empty() { "None" } else { context.as_str() },
            query
        );

        let request = ChatCompletionRequest::new(
            self.client.config().model.clone(),
            vec![Message::system(system_prompt)],
        );
        let response = self.client.chat_completion(&request).await?;
        Ok(response.first_content().unwrap_or_default().trim().to_string())
    }

    /// Reads queries from stdin until `quit` or end of input.
    pub async fn chat_loop(&mut self) -> Result<()> {
        println!("\n🤖 AI Assistant started! Type 'quit' to exit");
        let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();

        loop {
            print!("\nYou: ");
            std::io::stdout().flush()?;

            let Some(line) = lines.next_line().await? else {
                break;
            };
            let query = line.trim();
            if query.eq_ignore_ascii_case("quit") {
                break;
            }
            if query.is_empty() {
                continue;
            }

            let reply = self.process_query(query).await;
            println!("\n🤖: {}", reply);
        }

        Ok(())
    }
}

/// Reads the model's yes/no answer. A "yes" without a usable `city:` falls
/// back to extracting the city from the query itself.
fn parse_decision(decision: &str, query: &str) -> Option<String> {
    if DECLINE.is_match(decision) {
        return None;
    }
    if let Some(caps) = DECISION_CITY.captures(decision) {
        return Some(caps[1].to_string());
    }
    extract_city(query)
}
