//! Internal module used to collect span and event fields as trace event
//! args.
use trace_agent_core::{ArgValue, TraceArgs};
use tracing::field;

const MESSAGE_FIELD: &str = "message";

#[derive(Clone, Debug, Default, PartialEq)]
pub struct TraceArgsVisitor {
    message: Option<String>,
    args: TraceArgs,
}

impl TraceArgsVisitor {
    /// The formatted `message` field of an event, if any.
    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    pub fn into_args(self) -> TraceArgs {
        self.args
    }

    fn push(&mut self, field: &field::Field, value: ArgValue) {
        self.args.push(field.name(), value);
    }
}

impl field::Visit for TraceArgsVisitor {
    fn record_f64(&mut self, field: &field::Field, value: f64) {
        self.push(field, ArgValue::Double(value));
    }

    fn record_i64(&mut self, field: &field::Field, value: i64) {
        self.push(field, ArgValue::Int(value));
    }

    fn record_u64(&mut self, field: &field::Field, value: u64) {
        self.push(field, ArgValue::UInt(value));
    }

    fn record_i128(&mut self, field: &field::Field, value: i128) {
        match i64::try_from(value) {
            Ok(v) => self.push(field, ArgValue::Int(v)),
            Err(_) => self.push(field, ArgValue::Str(value.to_string())),
        }
    }

    fn record_u128(&mut self, field: &field::Field, value: u128) {
        match u64::try_from(value) {
            Ok(v) => self.push(field, ArgValue::UInt(v)),
            Err(_) => self.push(field, ArgValue::Str(value.to_string())),
        }
    }

    fn record_bool(&mut self, field: &field::Field, value: bool) {
        self.push(field, ArgValue::Bool(value));
    }

    fn record_str(&mut self, field: &field::Field, value: &str) {
        if field.name() == MESSAGE_FIELD {
            self.message = Some(value.to_owned());
        } else {
            self.push(field, ArgValue::Str(value.to_owned()));
        }
    }

    fn record_error(&mut self, field: &field::Field, value: &(dyn std::error::Error + 'static)) {
        self.push(field, ArgValue::Str(format!("{:#}", value)));
    }

    fn record_debug(&mut self, field: &field::Field, value: &dyn std::fmt::Debug) {
        if field.name() == MESSAGE_FIELD {
            self.message = Some(format!("{:?}", value));
        } else {
            self.push(field, ArgValue::Str(format!("{:?}", value)));
        }
    }
}
