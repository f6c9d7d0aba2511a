use std::str::FromStr;
use std::time::Duration;

/// Which processor delivers the email channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmailDelivery {
    /// Send through the HTTP mail API.
    Mail,
    /// Log the notification instead of sending it.
    Console,
}

impl FromStr for EmailDelivery {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "mail" => Ok(EmailDelivery::Mail),
            "console" => Ok(EmailDelivery::Console),
            other => Err(anyhow::anyhow!(
                "EMAIL_DELIVERY must be `mail` or `console`, got `{}`",
                other
            )),
        }
    }
}

/// Where notifications that exhausted their retries end up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeadLetterMode {
    /// Publish to the dead-letter topic.
    Broker,
    /// Log them.
    Console,
}

impl FromStr for DeadLetterMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "broker" => Ok(DeadLetterMode::Broker),
            "console" => Ok(DeadLetterMode::Console),
            other => Err(anyhow::anyhow!(
                "DEAD_LETTER_SINK must be `broker` or `console`, got `{}`",
                other
            )),
        }
    }
}

/// Global application configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// HTTP bind host
    pub host: String,

    /// HTTP bind port
    pub port: u16,

    /// Retry ceiling for every delivery channel (default: 3)
    pub notifications_retry_count: u32,

    /// Pause between two delivery attempts in seconds (default: 3)
    pub notifications_retry_interval_secs: u64,

    /// Redis connection string (cache, per-user log and broker streams)
    pub redis_url: String,

    /// Upper bound of one blocking read of a user's log (default: 5)
    pub redis_timeout_secs: u64,

    /// Broker consumer group name
    pub broker_consumer_group: String,

    /// Pause between broker consume attempts, also the block timeout (default: 6)
    pub broker_timeout_secs: u64,

    pub topic_email_notifications: String,
    pub topic_push_notifications: String,
    pub topic_ws_notifications: String,
    pub topic_dead_notifications: String,

    /// HTTP mail API endpoint
    pub mail_api_url: String,

    /// Bearer token for the mail API, required by the worker when
    /// `email_delivery` is `Mail`
    pub mail_api_key: Option<String>,

    /// Email sender address
    pub email_from: String,

    /// Mail API request timeout in seconds (default: 10)
    pub mail_timeout_secs: u64,

    pub email_delivery: EmailDelivery,

    pub dead_letter_sink: DeadLetterMode,

    /// Reject subscribe requests whose Origin differs from `ws_allowed_origin`
    pub ws_check_origin: bool,

    pub ws_allowed_origin: Option<String>,
}

impl AppConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());

        Ok(Self {
            host: var("HOST", "0.0.0.0"),
            port: parse(&lookup, "PORT", "8080")?,
            notifications_retry_count: parse(&lookup, "NOTIFICATIONS_RETRY_COUNT", "3")?,
            notifications_retry_interval_secs: parse(
                &lookup,
                "NOTIFICATIONS_RETRY_INTERVAL_SECONDS",
                "3",
            )?,
            redis_url: var("REDIS_URL", "redis://localhost:6379"),
            redis_timeout_secs: parse(&lookup, "REDIS_TIMEOUT_SECONDS", "5")?,
            broker_consumer_group: var("BROKER_CONSUMER_GROUP", "notifications-processor-async"),
            broker_timeout_secs: parse(&lookup, "BROKER_TIMEOUT_SECONDS", "6")?,
            topic_email_notifications: var("TOPIC_EMAIL_NOTIFICATIONS", "notifications.email"),
            topic_push_notifications: var("TOPIC_PUSH_NOTIFICATIONS", "notifications.push"),
            topic_ws_notifications: var("TOPIC_WS_NOTIFICATIONS", "notifications.ws"),
            topic_dead_notifications: var("TOPIC_DEAD_NOTIFICATIONS", "notifications.dead"),
            mail_api_url: var("MAIL_API_URL", "https://api.resend.com/emails"),
            mail_api_key: lookup("MAIL_API_KEY").filter(|k| !k.is_empty()),
            email_from: var("FROM_EMAIL", "email@notificator.ru"),
            mail_timeout_secs: parse(&lookup, "MAIL_TIMEOUT_SECONDS", "10")?,
            email_delivery: parse(&lookup, "EMAIL_DELIVERY", "mail")?,
            dead_letter_sink: parse(&lookup, "DEAD_LETTER_SINK", "broker")?,
            ws_check_origin: parse(&lookup, "WS_CHECK_ORIGIN", "true")?,
            ws_allowed_origin: lookup("WS_ALLOWED_ORIGIN").filter(|o| !o.is_empty()),
        })
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_secs(self.notifications_retry_interval_secs)
    }

    pub fn redis_timeout(&self) -> Duration {
        Duration::from_secs(self.redis_timeout_secs)
    }

    pub fn broker_timeout(&self) -> Duration {
        Duration::from_secs(self.broker_timeout_secs)
    }

    pub fn mail_timeout(&self) -> Duration {
        Duration::from_secs(self.mail_timeout_secs)
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn parse<T, F>(lookup: &F, key: &str, default: &str) -> anyhow::Result<T>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    let raw = lookup(key).unwrap_or_else(|| default.to_string());
    raw.parse()
        .map_err(|_| anyhow::anyhow!("{} has an invalid value: `{}`", key, raw))
}
