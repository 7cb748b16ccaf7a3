use tracing::field::Field;
use tracing::{Event, Subscriber};
use tracing_subscriber::{
    field::Visit,
    fmt::{format::Writer, FmtContext, FormatFields, FormattedFields},
    registry::LookupSpan,
};

use serde_json::{json, Map, Value};
use std::fmt::Write;

#[derive(Default)]
struct JsonVisitor(Map<String, Value>);

impl Visit for JsonVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        self.0.insert(field.name().into(), json!(format!("{:?}", value)));
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        self.0.insert(field.name().into(), json!(value));
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.0.insert(field.name().into(), json!(value));
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.0.insert(field.name().into(), json!(value));
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.0.insert(field.name().into(), json!(value));
    }
}

/// One json object per event.
///
/// Spans are listed outermost first with the fields they were created with,
/// so a line can be attributed to its channel, org and chaincode without
/// following the span tree.
pub(crate) struct FormatEvent;

impl<S, N> tracing_subscriber::fmt::FormatEvent<S, N> for FormatEvent
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'writer> FormatFields<'writer> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> std::fmt::Result {
        let now = chrono::offset::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true);
        let mut spans = vec![];
        ctx.visit_spans::<(), _>(|span| {
            let meta = span.metadata();
            // the json field formatter stores each span's fields as a json object
            let fields = span
                .extensions()
                .get::<FormattedFields<N>>()
                .and_then(|f| serde_json::from_str::<Value>(&f.fields).ok())
                .unwrap_or_else(|| json!({}));
            spans.push(json!({
                "name": meta.name(),
                "level": meta.level().as_str(),
                "fields": fields,
            }));
            Ok(())
        })
        .ok();

        let meta = event.metadata();
        let mut fields = JsonVisitor::default();
        event.record(&mut fields);
        let line = json!({
            "time": now,
            "level": meta.level().as_str(),
            "target": meta.target(),
            "file": meta.file(),
            "line": meta.line(),
            "fields": fields.0,
            "spans": spans,
        });
        writeln!(writer, "{}", line)
    }
}
