// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # OpenTelemetry Integration
//!
//! Propagates trace context through AMQP message headers: the publisher injects the
//! current context into outgoing headers and the consumer extracts it to parent the span
//! wrapping each handler invocation.

use lapin::types::{AMQPValue, FieldTable, LongString, ShortString};
use opentelemetry::{
    global::{self, BoxedSpan, BoxedTracer},
    propagation::{Extractor, Injector},
    trace::{SpanKind, Tracer},
    Context,
};
use std::{borrow::Cow, collections::BTreeMap};
use tracing::error;

/// An adapter for injecting and extracting OpenTelemetry context from AMQP headers.
pub(crate) struct HeaderPropagator<'a> {
    headers: &'a mut BTreeMap<ShortString, AMQPValue>,
}

impl<'a> HeaderPropagator<'a> {
    pub(crate) fn new(headers: &'a mut BTreeMap<ShortString, AMQPValue>) -> Self {
        Self { headers }
    }
}

impl Injector for HeaderPropagator<'_> {
    fn set(&mut self, key: &str, value: String) {
        self.headers.insert(
            key.to_lowercase().into(),
            AMQPValue::LongString(LongString::from(value)),
        );
    }
}

impl Extractor for HeaderPropagator<'_> {
    fn get(&self, key: &str) -> Option<&str> {
        self.headers.get(key).and_then(|header_value| {
            if let AMQPValue::LongString(header_value) = header_value {
                std::str::from_utf8(header_value.as_bytes())
                    .map_err(|e| error!("Error decoding header value {:?}", e))
                    .ok()
            } else {
                None
            }
        })
    }

    fn keys(&self) -> Vec<&str> {
        self.headers.keys().map(|header| header.as_str()).collect()
    }
}

/// Injects `ctx` into `headers`, keeping the headers already present.
pub(crate) fn inject(ctx: &Context, headers: &mut FieldTable) {
    let mut btree = headers.inner().clone();

    global::get_text_map_propagator(|propagator| {
        propagator.inject_context(ctx, &mut HeaderPropagator::new(&mut btree))
    });

    *headers = FieldTable::from(btree);
}

/// Creates a consumer span named `name`, parented on the context carried by `headers`.
pub(crate) fn new_span(headers: &FieldTable, tracer: &BoxedTracer, name: &str) -> (Context, BoxedSpan) {
    let mut btree = headers.inner().clone();
    let ctx = global::get_text_map_propagator(|propagator| {
        propagator.extract(&HeaderPropagator::new(&mut btree))
    });

    let span = tracer
        .span_builder(Cow::from(name.to_owned()))
        .with_kind(SpanKind::Consumer)
        .start_with_context(tracer, &ctx);

    (ctx, span)
}
