//! Send command

use anyhow::{anyhow, Result};

use wallet_sync::config::Config;
use wallet_sync::remote::Recipient;

use super::{print_success, prompt_confirm, Session};

/// Run the send command
pub async fn run(config: &Config, address: &str, amount: u64, fee: u64, yes: bool) -> Result<()> {
    let mut session = Session::open(config).await?;

    let balance = session.wallet.balance();
    let total = amount
        .checked_add(fee)
        .ok_or_else(|| anyhow!("Amount plus fee overflows"))?;
    if total > balance {
        return Err(anyhow!(
            "Insufficient balance: need {}, have {}",
            total,
            balance
        ));
    }

    println!();
    println!("  To:     {}", address);
    println!("  Amount: {}", amount);
    println!("  Fee:    {}", fee);
    println!();
    if !yes && !prompt_confirm("Send this transaction?")? {
        println!("Cancelled.");
        return session.close();
    }

    session.unlock().await?;

    let recipients = [Recipient {
        addr_b58: address.to_string(),
        value: amount,
    }];
    let tx_hash = session.wallet.send_funds(&recipients, fee).await?;
    print_success(&format!("Broadcast transaction {}", tx_hash));

    session.close()
}
