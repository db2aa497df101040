use crate::gate::Decision;
use crate::operator::Reply;
use crate::ui::{theme, Icons};
use owo_colors::OwoColorize;

pub fn header(text: &str) {
    println!("{} {}", Icons::SHIELD, text.style(theme().title));
}

pub fn success(label: &str) {
    println!("{} {}", Icons::CHECK, label.style(theme().granted));
}

pub fn error(label: &str) {
    eprintln!("{} {}", Icons::CROSS, label.style(theme().failure));
}

pub fn warn(label: &str) {
    eprintln!("{} {}", Icons::WARN, label.style(theme().refused));
}

pub fn info(label: &str, value: &str) {
    println!(
        "{} {}: {}",
        Icons::INFO.style(theme().note),
        label.style(theme().label),
        value
    );
}

pub fn section(title: &str) {
    println!();
    println!("━{}━", title.style(theme().title));
}

pub fn dim(text: &str) -> String {
    text.style(theme().label).to_string()
}

pub fn summary_row(label: &str, value: &str) {
    println!("  {} {}", label.style(theme().label), value);
}

/// Print an operator reply, refusals to stderr.
pub fn reply(reply: &Reply) {
    if reply.ok {
        success(&reply.text);
    } else {
        warn(&reply.text);
    }
}

/// Print what the gate would do with `name`.
pub fn decision(name: &str, decision: &Decision) {
    let style = theme().decision(decision);
    match decision {
        Decision::Permit => println!("{} {}", Icons::CHECK, format!("{} may connect", name).style(style)),
        Decision::Deny(message) => {
            println!("{} {}", Icons::CROSS, format!("{} would be denied", name).style(style));
            summary_row("Kick message:", message);
        }
    }
}
