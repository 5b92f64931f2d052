//! Cross-crate tests: a real host context, real satellite contexts and an
//! SQLite database behind the query proxy.

#[cfg(test)]
mod properties;
#[cfg(test)]
mod scenarios;
