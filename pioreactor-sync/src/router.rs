//! Topic router: hands each inbound `(topic, payload)` to the handler whose
//! pattern matches. Unmatched topics are dropped, the bus carries plenty of
//! traffic that is not ours.

use crate::topic::{Topic, TopicMatch, TopicPattern};
use tracing::trace;

/// Handler invoked with the owning state, the bound wildcards and the raw payload.
pub type Handler<C> = Box<dyn Fn(&mut C, &TopicMatch, &[u8]) + Send + Sync>;

struct Route<C> {
    pattern: TopicPattern,
    handler: Handler<C>,
}

/// Routes over a state `C` owned by the caller, so handlers can mutate it
/// without any locking of their own.
pub struct TopicRouter<C> {
    routes: Vec<Route<C>>,
}

impl<C> TopicRouter<C> {
    pub fn new() -> Self {
        Self { routes: Vec::new() }
    }

    pub fn register<F>(&mut self, pattern: TopicPattern, handler: F) -> &mut Self
    where
        F: Fn(&mut C, &TopicMatch, &[u8]) + Send + Sync + 'static,
    {
        self.routes.push(Route {
            pattern,
            handler: Box::new(handler),
        });
        self
    }

    /// Invokes the first registered handler whose pattern matches.
    /// Returns whether anything handled the message.
    pub fn route(&self, state: &mut C, topic: &str, payload: &[u8]) -> bool {
        let topic = Topic::parse(topic);
        for route in &self.routes {
            if let Some(matched) = route.pattern.capture(&topic) {
                (route.handler)(state, &matched, payload);
                return true;
            }
        }
        trace!(%topic, "no route");
        false
    }
}

impl<C> Default for TopicRouter<C> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topic::UNIT_POSITION;

    #[derive(Default)]
    struct Seen {
        logs: Vec<(String, String)>,
        telemetry: Vec<String>,
    }

    fn router() -> TopicRouter<Seen> {
        let mut router = TopicRouter::new();
        router
            .register(TopicPattern::parse("pioreactor/+/+/logs/+"), |seen: &mut Seen, m, payload| {
                seen.logs.push((
                    m.segment(UNIT_POSITION).unwrap_or_default().to_string(),
                    String::from_utf8_lossy(payload).into_owned(),
                ));
            })
            .register(
                TopicPattern::throughput("expA"),
                |seen: &mut Seen, m, _payload| {
                    seen.telemetry.push(m.wildcard(1).unwrap_or_default().to_string());
                },
            );
        router
    }

    #[test]
    fn dispatches_to_matching_handler() {
        let router = router();
        let mut seen = Seen::default();

        assert!(router.route(&mut seen, "pioreactor/unit3/expA/logs/app", b"hello"));
        assert!(router.route(
            &mut seen,
            "pioreactor/u1/expA/throughput_calculating/media_throughput",
            b"1.5"
        ));

        assert_eq!(seen.logs, vec![("unit3".to_string(), "hello".to_string())]);
        assert_eq!(seen.telemetry, vec!["media_throughput".to_string()]);
    }

    #[test]
    fn unmatched_topics_are_a_no_op() {
        let router = router();
        let mut seen = Seen::default();

        assert!(!router.route(&mut seen, "pioreactor/unit3/logs/app", b"short"));
        assert!(!router.route(&mut seen, "other/fleet/topic", b""));
        assert!(seen.logs.is_empty());
        assert!(seen.telemetry.is_empty());
    }
}
