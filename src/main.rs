use clap::{Parser, Subcommand};
use ernie_deploy::client::{SMOKE_TEST_SYSTEM_PROMPT, SMOKE_TEST_USER_PROMPT};
use ernie_deploy::openai::{ChatCompletionRequest, Message};
use ernie_deploy::{Assistant, Config, DeployManager, McpWeatherTool, Result, ServiceStatus, WeatherTool};
use futures::StreamExt;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "ernie-deploy")]
#[command(about = "Deploy ERNIE-4.5 with FastDeploy, check it, and chat with a weather assistant")]
struct Cli {
    /// JSON configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
    /// Host the server binds to and the client connects to
    #[arg(long, global = true)]
    host: Option<String>,
    /// Port of the OpenAI-compatible API
    #[arg(short, long, global = true)]
    port: Option<u16>,
    /// Model path or name passed to FastDeploy
    #[arg(short, long, global = true)]
    model: Option<String>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check whether the server answers on /v1/models
    Check,
    /// Launch the server and wait until it is ready
    Start,
    /// Send the smoke-test chat completion
    Test {
        /// Stream the answer token by token
        #[arg(long)]
        stream: bool,
    },
    /// Check, launch if needed, and smoke-test
    Setup,
    /// List models served by the running server
    Models,
    /// Interactive weather assistant backed by an MCP server script
    Chat { server_script: PathBuf },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let config = load_config(&cli)?;
    let manager = DeployManager::new(config)?;

    match cli.command {
        Commands::Check => {
            if !manager.check_service().await {
                anyhow::bail!("Service is not available at {}", manager.client().config().base_url());
            }
            println!("✅ Service is running at {}", manager.client().config().base_url());
        }
        Commands::Start => {
            let pid = manager.start().await?;
            println!("✅ Server ready (pid {:?}). Press Ctrl+C to stop.", pid);
            serve_until_stopped(&manager).await?;
        }
        Commands::Test { stream } => run_smoke_test(&manager, stream).await?,
        Commands::Setup => match manager.setup_service().await? {
            ServiceStatus::AlreadyRunning => {
                println!("✅ Service already running, nothing launched");
            }
            ServiceStatus::Started { pid, smoke_test_passed } => {
                println!(
                    "✅ Server started (pid {:?}), smoke test {}. Press Ctrl+C to stop.",
                    pid,
                    if smoke_test_passed { "passed" } else { "FAILED" }
                );
                serve_until_stopped(&manager).await?;
            }
        },
        Commands::Models => {
            let models = manager.client().list_models().await?;
            for model in models.data {
                println!("{}\t{}", model.id, model.owned_by);
            }
        }
        Commands::Chat { server_script } => run_chat(&manager, &server_script).await?,
    }

    Ok(())
}

fn load_config(cli: &Cli) -> Result<Config> {
    let mut config = Config::load(cli.config.as_deref())?;

    if let Some(host) = &cli.host {
        config.server.host = host.clone();
    }
    if let Some(port) = cli.port {
        config.server.port = port;
    }
    if let Some(model) = &cli.model {
        config.server.model = model.clone();
    }
    if cli.host.is_some() || cli.port.is_some() {
        // Follow the overridden server address
        config.client.base_url = None;
    }

    Ok(config)
}

async fn serve_until_stopped(manager: &DeployManager) -> Result<()> {
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Received Ctrl+C");
        }
        status = manager.wait() => {
            if let Some(status) = status? {
                anyhow::bail!("Inference server exited unexpectedly ({})", status);
            }
            return Ok(());
        }
    }
    manager.shutdown().await
}

async fn run_smoke_test(manager: &DeployManager, stream: bool) -> Result<()> {
    if !stream {
        let content = manager
            .smoke_test()
            .await
            .ok_or_else(|| anyhow::anyhow!("Smoke test failed"))?;
        println!("✅ Model response:\n{}", content);
        return Ok(());
    }

    let client = manager.client();
    let request = ChatCompletionRequest::new(
        client.config().model.clone(),
        vec![
            Message::system(SMOKE_TEST_SYSTEM_PROMPT),
            Message::user(SMOKE_TEST_USER_PROMPT),
        ],
    )
    .with_max_tokens(client.config().smoke_test_max_tokens);

    let mut tokens = client.chat_completion_stream(&request).await?;
    while let Some(token) = tokens.next().await {
        print!("{}", token?);
        std::io::stdout().flush()?;
    }
    println!();
    Ok(())
}

async fn run_chat(manager: &DeployManager, server_script: &Path) -> Result<()> {
    if !manager.check_service().await {
        tracing::warn!("Local model is not answering; non-weather questions will fail until it is up");
    }

    let tool = Arc::new(McpWeatherTool::connect(server_script).await?);
    if !tool.is_available() {
        println!("⚠️ The MCP server does not provide a weather tool; weather questions will fail");
    }

    let weather: Arc<dyn WeatherTool> = tool.clone();
    let mut assistant = Assistant::new(manager.client().clone(), weather);
    let result = assistant.chat_loop().await;

    tool.close().await?;
    result
}
