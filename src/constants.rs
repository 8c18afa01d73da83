use std::time::Duration;

pub const RETRYABLE_STATUS_CODES: &[u16] = &[429, 500, 502, 503, 504];
pub const RETRY_BASE_DELAY_MS: u64 = 500;

/// Most recent messages forwarded upstream; older ones are dropped, never summarized.
pub const MAX_HISTORY_MESSAGES: usize = 40;

/// Upstream defaults (Mistral speaks the OpenAI chat-completions dialect)
pub const DEFAULT_UPSTREAM_URL: &str = "https://api.mistral.ai/v1/chat/completions";
pub const DEFAULT_MODEL: &str = "mistral-large-latest";
pub const UPSTREAM_KEY_ENV: &str = "MISTRAL_API_KEY";

/// Frame layout of the downstream event stream
pub const FRAME_PREFIX: &str = "data: ";
pub const FRAME_SEPARATOR: &str = "\n\n";
pub const MAX_FRAME_LINE_BYTES: usize = 1024 * 1024;

/// Tool names and timings
pub const CHART_TOOL_NAME: &str = "generate_chart";
pub const CHART_PROGRESS_DELAY: Duration = Duration::from_millis(400);
pub const CHART_HIDE_DELAY: Duration = Duration::from_millis(500);
pub const TOOL_START_DESCRIPTION: &str = "Working...";
pub const CHART_COMPLETE_MESSAGE: &str = "Chart generated successfully";
pub const CHART_ERROR_MESSAGE: &str = "Error generating chart";

/// Hidden marker folded into assistant content after a chart tool call
pub const CHART_MARKER_PREFIX: &str = "<!-- CHART_DATA:";
pub const CHART_MARKER_SUFFIX: &str = " -->";

/// Client-side fallback shown when a turn dies mid-flight
pub const FALLBACK_ERROR_MESSAGE: &str = "Désolé, une erreur s'est produite. Veuillez réessayer.";

/// Conversation store
pub const CONVERSATION_TITLE_CHARS: usize = 50;

pub const CHAT_ENDPOINT: &str = "/api/chat";
pub const TURN_ID_HEADER: &str = "x-turn-id";

/// Downstream transport
pub const SSE_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(15);
pub const SSE_CHANNEL_CAPACITY: usize = 100;
