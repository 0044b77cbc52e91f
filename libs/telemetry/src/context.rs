use tracing::{Span, info_span};

#[derive(Debug, Clone)]
pub struct TelemetryLabels {
    pub device_id: String,
    pub hub: Option<String>,
    pub session_id: Option<String>,
    pub extra: Vec<(String, String)>,
}

impl TelemetryLabels {
    pub fn new(device_id: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            hub: None,
            session_id: None,
            extra: Vec::new(),
        }
    }

    pub fn with_hub(mut self, hub: impl Into<String>) -> Self {
        self.hub = Some(hub.into());
        self
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn tags(&self) -> Vec<(String, String)> {
        let mut tags = Vec::with_capacity(3 + self.extra.len());
        tags.push(("device_id".into(), self.device_id.clone()));
        if let Some(hub) = &self.hub {
            tags.push(("hub".into(), hub.clone()));
        }
        if let Some(session) = &self.session_id {
            tags.push(("session_id".into(), session.clone()));
        }
        for (key, value) in &self.extra {
            tags.push((key.clone(), value.clone()));
        }
        tags
    }

    /// Root span for work done on behalf of this device.
    pub fn span(&self) -> Span {
        let span = info_span!(
            "device",
            device_id = tracing::field::Empty,
            hub = tracing::field::Empty,
            session_id = tracing::field::Empty
        );
        crate::with_common_fields(&span, &self.device_id, self.session_id.as_deref());
        if let Some(hub) = &self.hub {
            span.record("hub", tracing::field::display(hub));
        }
        span
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tags_skip_missing_labels() {
        let labels = TelemetryLabels::new("thermostat-01").with_session("abc");
        assert_eq!(
            labels.tags(),
            vec![
                ("device_id".to_string(), "thermostat-01".to_string()),
                ("session_id".to_string(), "abc".to_string()),
            ]
        );
    }
}
