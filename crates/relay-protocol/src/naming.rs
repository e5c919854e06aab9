//! Exchange and queue naming conventions.

/// Build an exchange name in the form `{owner}.{name}`.
///
/// `exchange_name("subscriptions", "primary")` yields `subscriptions.primary`.
#[must_use]
pub fn exchange_name(app_name: &str, exchange: &str) -> String {
    format!("{}.{}", app_name, exchange)
}

/// Build a queue name in the form `{owner}.{env}.{name}`.
///
/// Keeping the environment in the name separates test queues from
/// production ones bound to the same exchange.
#[must_use]
pub fn queue_name(app_name: &str, app_env: &str, queue: &str) -> String {
    format!("{}.{}.{}", app_name, app_env, queue)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exchange_name() {
        assert_eq!(exchange_name("subscriptions", "primary"), "subscriptions.primary");
    }

    #[test]
    fn test_queue_name() {
        assert_eq!(
            queue_name("subscriptions", "prod", "primary"),
            "subscriptions.prod.primary"
        );
    }
}
