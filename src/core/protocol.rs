//! Purpose: Parse wire commands and console directives and render every reply.
//! Exports: `Request`, `Directive`, `DirectiveOutcome`, `handle_request`, `handle_directive`.
//! Role: Stateless text layer between the transports and the store.
//! Invariants: Every reply is newline-terminated ASCII.
//! Invariants: Invalid input is rejected before the store is touched.

use tracing::warn;

use crate::core::error::Error;
use crate::core::recipe::{self, DeliverOutcome, Molecule, Product};
use crate::core::store::{Atom, CEILING, Inventory, InventoryStore, StoreOutcome};

/// Broadcast to every live stream connection before the server exits.
/// Clients key off the "shutting down" phrase, so the wording is load-bearing.
pub const SHUTDOWN_NOTICE: &str = "Server shutting down.\n";

const INVALID_DELIVER: &str = "ERROR: Invalid DELIVER command.\n";
const STORE_UNAVAILABLE: &str = "ERROR: Inventory store unavailable.\n";

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Request {
    Add { atom: Atom, amount: u64 },
    Deliver { molecule: Molecule, quantity: u64 },
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Directive {
    Produce(Product),
    Shutdown,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum DirectiveOutcome {
    Reply(String),
    Shutdown,
}

pub fn status_line(counters: Inventory) -> String {
    format!(
        "Status: CARBON: {}, OXYGEN: {}, HYDROGEN: {}",
        counters.carbon, counters.oxygen, counters.hydrogen
    )
}

pub fn welcome_line(counters: Inventory) -> String {
    format!("Welcome. {}\n", status_line(counters))
}

/// Handles one client line end to end and returns the full reply text,
/// possibly multi-line. Store failures are answered and logged, never
/// propagated — a lock hiccup must not take the server down.
pub fn handle_request(store: &dyn InventoryStore, line: &str) -> String {
    let request = match parse_request(line) {
        Ok(request) => request,
        Err(reply) => return reply,
    };
    match apply_request(store, request) {
        Ok(reply) => reply,
        Err(err) => {
            warn!(error = %err, "inventory store unavailable");
            String::from(STORE_UNAVAILABLE)
        }
    }
}

/// Parses one client line. `Err` carries the exact reply owed to the peer.
pub fn parse_request(line: &str) -> Result<Request, String> {
    let tokens: Vec<&str> = line.split_whitespace().collect();
    match tokens.first().copied() {
        Some("ADD") => parse_add(line, &tokens[1..]),
        Some("DELIVER") => parse_deliver(&tokens[1..]),
        _ => Err(invalid_format(line)),
    }
}

fn parse_add(line: &str, args: &[&str]) -> Result<Request, String> {
    if args.len() != 2 {
        return Err(invalid_format(line));
    }
    let atom_token = args[0];
    let amount_token = args[1];

    let amount = match parse_count(amount_token) {
        Count::Valid(amount) => amount,
        Count::TooLarge => {
            return Err(format!(
                "ERROR: Amount too large, max allowed per command is {CEILING}.\n"
            ));
        }
        Count::Invalid => {
            return Err(format!(
                "ERROR: Invalid amount {amount_token} (must be 1-{CEILING}).\n"
            ));
        }
    };
    let Some(atom) = Atom::from_token(atom_token) else {
        return Err(format!("ERROR: Unknown atom type: {atom_token}\n"));
    };
    Ok(Request::Add { atom, amount })
}

fn parse_deliver(args: &[&str]) -> Result<Request, String> {
    if args.is_empty() {
        return Err(String::from(INVALID_DELIVER));
    }

    // The two-word name is tried first so CARBON DIOXIDE never half-matches.
    let (molecule, tail) = if args.len() >= 2 {
        let joined = format!("{} {}", args[0], args[1]);
        match Molecule::from_token(&joined) {
            Some(molecule) => (Some(molecule), &args[2..]),
            None => (Molecule::from_token(args[0]), &args[1..]),
        }
    } else {
        (Molecule::from_token(args[0]), &args[1..])
    };

    let Some(molecule) = molecule else {
        return Err(format!("ERROR: Unknown molecule: {}\n", unknown_name(args)));
    };

    let quantity = match tail {
        [] => 1,
        [token] => match parse_count(token) {
            Count::Valid(quantity) => quantity,
            // A present quantity is never coerced; zero and oversized both
            // fail the same way.
            Count::TooLarge | Count::Invalid => {
                return Err(format!(
                    "ERROR: Invalid quantity {token} (must be 1-{CEILING}).\n"
                ));
            }
        },
        _ => return Err(String::from(INVALID_DELIVER)),
    };

    Ok(Request::Deliver { molecule, quantity })
}

/// Name to echo for an unrecognized molecule: the args minus a trailing
/// quantity token, rejoined with single spaces.
fn unknown_name(args: &[&str]) -> String {
    if args.len() >= 2 {
        let last = args[args.len() - 1];
        if !last.is_empty() && last.bytes().all(|b| b.is_ascii_digit()) {
            return args[..args.len() - 1].join(" ");
        }
    }
    args.join(" ")
}

fn invalid_format(line: &str) -> String {
    format!("ERROR: Invalid command format: {line}\n")
}

enum Count {
    Valid(u64),
    TooLarge,
    Invalid,
}

fn parse_count(token: &str) -> Count {
    match token.parse::<u64>() {
        Ok(0) => Count::Invalid,
        Ok(value) if value > CEILING => Count::TooLarge,
        Ok(value) => Count::Valid(value),
        Err(_) => {
            // All-digit tokens that overflow u64 are over the ceiling too.
            if !token.is_empty() && token.bytes().all(|b| b.is_ascii_digit()) {
                Count::TooLarge
            } else {
                Count::Invalid
            }
        }
    }
}

fn apply_request(store: &dyn InventoryStore, request: Request) -> Result<String, Error> {
    match request {
        Request::Add { atom, amount } => match store.try_add(atom, amount)? {
            StoreOutcome::Applied(counters) => Ok(format!(
                "SUCCESS: Added {amount} {atom}. Total {atom}: {total}\n{status}\n",
                total = counters.get(atom),
                status = status_line(counters),
            )),
            StoreOutcome::Rejected => Ok(format!(
                "ERROR: Adding this would exceed {atom} storage limit ({CEILING}).\n"
            )),
        },
        Request::Deliver { molecule, quantity } => {
            match recipe::deliver(store, molecule, quantity)? {
                DeliverOutcome::Delivered(_) if quantity == 1 => {
                    Ok(String::from("Molecule delivered successfully.\n"))
                }
                DeliverOutcome::Delivered(_) => {
                    Ok(format!("Delivered {quantity} {molecule} successfully.\n"))
                }
                DeliverOutcome::InsufficientStock => {
                    Ok(String::from("Not enough atoms for this molecule.\n"))
                }
            }
        }
    }
}

/// Handles one console line. Shutdown surfaces as its own variant so the
/// reactor decides what closing down means.
pub fn handle_directive(store: &dyn InventoryStore, line: &str) -> DirectiveOutcome {
    let directive = match parse_directive(line) {
        Ok(directive) => directive,
        Err(reply) => return DirectiveOutcome::Reply(reply),
    };
    match directive {
        Directive::Shutdown => DirectiveOutcome::Shutdown,
        Directive::Produce(product) => match store.snapshot() {
            Ok(counters) => DirectiveOutcome::Reply(produce_reply(product, counters)),
            Err(err) => {
                warn!(error = %err, "inventory store unavailable");
                DirectiveOutcome::Reply(String::from(STORE_UNAVAILABLE))
            }
        },
    }
}

/// `shutdown` must match the whole trimmed line; a prefix match would also
/// accept lines like "shutdowns".
pub fn parse_directive(line: &str) -> Result<Directive, String> {
    let trimmed = line.trim();
    if trimmed == "shutdown" {
        return Ok(Directive::Shutdown);
    }
    if let Some(rest) = trimmed.strip_prefix("GEN ") {
        if let Some(product) = Product::from_token(rest.trim()) {
            return Ok(Directive::Produce(product));
        }
    }
    Err(format!(
        "Unknown command: {trimmed}\nAvailable commands: GEN SOFT DRINK, GEN VODKA, GEN CHAMPAGNE, shutdown\n"
    ))
}

fn produce_reply(product: Product, counters: Inventory) -> String {
    let [first, second, third] = product.molecules();
    format!(
        "Can produce {count} {product}(s) (needs: {first} + {second} + {third})\n",
        count = product.max_producible(counters),
    )
}
