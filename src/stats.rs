//! Credential pool inspection for the `dst credentials` command.

use crate::credentials::CredentialPool;

/// Print the pool's configuration and health counters.
///
/// Secrets never leave the pool; only identifiers, models, and usage
/// counters are shown.
pub fn print_credentials(pool: &CredentialPool) {
    let stats = pool.stats();

    println!("credentials");
    println!("  configured: {}", stats.credentials.len());
    println!("  total calls: {}", stats.total_calls);
    println!("  succeeded: {}", stats.total_success);
    println!("  failed: {}", stats.total_failed);
    println!();
    println!(
        "  {:<16} {:<10} {:<24} {:>6} {:>8} {:>9}  {}",
        "id", "provider", "model", "calls", "rate", "failures", "state"
    );
    for c in &stats.credentials {
        let state = if !c.enabled {
            "disabled"
        } else if c.in_cooldown {
            "cooldown"
        } else {
            "active"
        };
        println!(
            "  {:<16} {:<10} {:<24} {:>6} {:>7.1}% {:>9}  {}",
            c.id, c.provider, c.model, c.total_calls, c.success_rate, c.consecutive_failures, state
        );
    }
}
