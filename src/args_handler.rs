use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser, Debug, Clone)]
#[command(version, about = "Chat with a local model, streamed to your terminal")]
pub struct Args {
    /// The file holding the system prompt, read once at startup
    #[clap(long = "system-prompt", env = "SYSTEM_PROMPT_PATH", default_value = "system_prompt.txt")]
    pub system_prompt: PathBuf,

    /// Base url of the Ollama server
    #[clap(long, env = "OLLAMA_URL", default_value = "http://localhost:11434")]
    pub base_url: String,

    /// The model to chat with. e.g. `qwen3:latest` or `llama3.2`
    #[clap(short = 'm', long, env = "OLLAMA_MODEL", default_value = "qwen3:latest")]
    pub model: String,

    /// seconds to wait when connecting to the server
    #[clap(long, default_value_t = 5, value_parser = clap::value_parser!(u64).range(1..))]
    pub connect_timeout: u64,

    /// seconds to wait for the next piece of a streamed reply before giving up on the turn
    #[clap(long, default_value_t = 30, value_parser = clap::value_parser!(u64).range(1..))]
    pub read_timeout: u64,

    /// do not contact the server before the first prompt
    #[clap(long, action)]
    pub skip_readiness_check: bool,

    /// show the fragment/s speed at the end of each turn
    #[clap(short = 'v', long, action)]
    pub verbose: bool,
}

impl Args {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout)
    }
}
