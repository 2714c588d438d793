//! `switchyard routes`: show what this service sends and consumes.

use std::fmt::Write as _;

use switchyard_topology::{MessageDeclaration, MessageRoute, QueueBinding, RouteResolver};

use super::load_service;
use crate::config::AppConfig;

pub fn run(config: &AppConfig) -> anyhow::Result<()> {
    let resolver = RouteResolver::new(load_service(config)?);
    print!("{}", render(&resolver));
    Ok(())
}

fn render(resolver: &RouteResolver) -> String {
    let entry = resolver.entry();
    let mut out = format!("Service {}\n\nOutbound:\n", resolver.service_code());

    let outbound = resolver.outbound_routes();
    if outbound.is_empty() {
        out.push_str("  (none)\n");
    }
    for route in &outbound {
        let decl = entry.find(route.kind, &route.code);
        out.push_str(&outbound_line(route, decl));
    }

    out.push_str("\nInput queues:\n");
    let queues = resolver.input_queues();
    if queues.is_empty() {
        out.push_str("  (none)\n");
    }
    for queue in &queues {
        let decl = entry.find(queue.kind, &queue.code);
        out.push_str(&queue_line(queue, decl));
    }
    out
}

fn outbound_line(route: &MessageRoute, decl: Option<&MessageDeclaration>) -> String {
    let mut line = format!(
        "  {:<24} {:<12} {} exchange={:?} key={:?}",
        route.code,
        route.kind.to_string(),
        route.endpoint,
        route.exchange,
        route.routing_key,
    );
    if let Some(timeout) = route.timeout {
        let _ = write!(line, " timeout={}s", timeout.as_secs_f64());
    }
    push_declaration_notes(&mut line, decl);
    line.push('\n');
    line
}

fn queue_line(queue: &QueueBinding, decl: Option<&MessageDeclaration>) -> String {
    let mut line = format!(
        "  {:<24} {:<12} {} queue={:?} exchange={:?} key={:?}",
        queue.code,
        queue.kind.to_string(),
        queue.endpoint,
        queue.queue,
        queue.exchange,
        queue.routing_key,
    );
    push_declaration_notes(&mut line, decl);
    line.push('\n');
    line
}

fn push_declaration_notes(line: &mut String, decl: Option<&MessageDeclaration>) {
    let Some(decl) = decl else {
        return;
    };
    if let Some(response) = decl.response_code.as_deref().filter(|r| !r.is_empty()) {
        let _ = write!(line, " response={response}");
    }
    if let Some(description) = decl.description.as_deref().filter(|d| !d.is_empty()) {
        let _ = write!(line, "  # {description}");
    }
}
