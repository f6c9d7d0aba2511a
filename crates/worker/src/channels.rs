//! Channel wiring for the worker process.

use std::sync::Arc;

use herald_common::config::{AppConfig, EmailDelivery};
use herald_common::error::{AppError, AppResult};
use herald_notifier::broker::{BrokerConsumer, BrokerProducer};
use herald_notifier::channel::{Channel, RetryPolicy};
use herald_notifier::contracts::NotificationsProcessor;
use herald_notifier::dead_letter::dead_letter_sink_from_config;
use herald_notifier::mail::HttpMailTransport;
use herald_notifier::observers::BrokerNotificationsObserver;
use herald_notifier::processors::{ConsoleProcessor, EmailProcessor};

/// Processor selected by `EMAIL_DELIVERY`.
pub fn email_processor(config: &AppConfig) -> AppResult<Arc<dyn NotificationsProcessor>> {
    match config.email_delivery {
        EmailDelivery::Mail => {
            let api_key = config.mail_api_key.as_deref().ok_or_else(|| {
                AppError::Config("MAIL_API_KEY is required for mail delivery".to_string())
            })?;
            let transport =
                HttpMailTransport::new(&config.mail_api_url, api_key, config.mail_timeout())?;
            Ok(Arc::new(EmailProcessor::new(
                Arc::new(transport),
                config.email_from.clone(),
            )))
        }
        EmailDelivery::Console => Ok(Arc::new(ConsoleProcessor::new("email"))),
    }
}

/// Build the `email` and `push` channels, each consuming its own topic.
pub fn build_channels<B>(config: &AppConfig, broker: Arc<B>) -> AppResult<Vec<Arc<Channel>>>
where
    B: BrokerConsumer + BrokerProducer + 'static,
{
    let retry = RetryPolicy::from_config(config);
    let observer = |topic: &str| {
        Arc::new(BrokerNotificationsObserver::new(
            topic,
            broker.clone(),
            config.broker_timeout(),
        ))
    };

    let email = Channel::new(
        "email",
        retry,
        observer(&config.topic_email_notifications),
        email_processor(config)?,
        dead_letter_sink_from_config(config, broker.clone()),
    );
    let push = Channel::new(
        "push",
        retry,
        observer(&config.topic_push_notifications),
        Arc::new(ConsoleProcessor::new("push")),
        dead_letter_sink_from_config(config, broker.clone()),
    );

    Ok(vec![email, push])
}
