use std::fmt::Display;

use colored::*;

pub fn print_header(realm: &str, base_url: &str) {
    println!(
        "{} {} {}",
        "realm-sso".bold(),
        format!("v{}", env!("CARGO_PKG_VERSION")).dimmed(),
        format!("[{} @ {}]", realm, base_url).cyan()
    );
}

fn print_tagged(tag: ColoredString, msg: impl Display) {
    println!("{:>7} {}", tag, msg);
}

pub fn print_step(msg: &str) {
    print_tagged("->".cyan().bold(), msg);
}

pub fn print_success(msg: &str) {
    print_tagged("ok".green().bold(), msg);
}

pub fn print_warning(msg: &str) {
    print_tagged("warning".yellow().bold(), msg.yellow());
}

pub fn print_error(msg: &str) {
    print_tagged("error".red().bold(), msg.red());
}
