use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use solana_account_decoder::UiAccountData;
use solana_client::nonblocking::rpc_client::RpcClient;
use solana_client::rpc_request::TokenAccountsFilter;
use solana_sdk::{
    instruction::Instruction,
    message::Message,
    pubkey::Pubkey,
    signature::{Keypair, Signer},
    system_instruction,
    transaction::{Transaction, VersionedTransaction},
};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::auto_return::{SweepExecutor, SweepPlan, SweepReport};
use crate::envelope_crypto::{self, aad_for};
use crate::rpc_quorum::RpcPool;
use crate::wallet_store::WalletStore;

struct TokenHolding {
    mint: String,
    account: Pubkey,
    amount: u64,
}

/// Live sweep executor: recovers the wallet key server-side, drains SPL
/// token accounts and then SOL down to the keep floor, and races the
/// transactions through the quorum pool.
///
/// Pass-phrase-protected wallets cannot be swept here: their DEK died with
/// the session. Those are skipped with a warning.
pub struct RpcSweeper {
    wallet_store: WalletStore,
    pool: Arc<RpcPool>,
    reader: RpcClient,
    server_secret: String,
}

impl RpcSweeper {
    pub fn new(
        wallet_store: WalletStore,
        pool: Arc<RpcPool>,
        reader_url: String,
        server_secret: String,
    ) -> Self {
        let reader = RpcClient::new_with_timeout(reader_url, Duration::from_secs(15));
        Self { wallet_store, pool, reader, server_secret }
    }

    fn recover_keypair(&self, user_id: &str, wallet_id: &str) -> Result<Keypair> {
        let wallet = self
            .wallet_store
            .get_wallet(user_id, wallet_id)?
            .ok_or_else(|| anyhow!("wallet {wallet_id} not found"))?;

        let aad = aad_for(user_id, wallet_id);
        let secret = if let Some(envelope) = wallet.envelope.as_ref() {
            if envelope.is_protected() {
                return Err(anyhow!("wallet {wallet_id} is passphrase-protected; cannot sweep"));
            }
            envelope_crypto::decrypt_unprotected(envelope, user_id, &self.server_secret, &aad)
                .context("opening unprotected envelope")?
        } else if let Some(blob) = wallet.legacy_private_key.as_ref() {
            envelope_crypto::decrypt_legacy(blob, &self.server_secret)
                .context("opening legacy secret")?
        } else {
            return Err(anyhow!("wallet {wallet_id} has no recoverable secret"));
        };

        Keypair::from_bytes(&secret).context("secret is not a valid keypair")
    }

    async fn token_holdings(&self, owner: &Pubkey) -> Result<Vec<TokenHolding>> {
        let accounts = self
            .reader
            .get_token_accounts_by_owner(owner, TokenAccountsFilter::ProgramId(spl_token::id()))
            .await
            .context("listing token accounts")?;

        let mut holdings = Vec::new();
        for keyed in accounts {
            let UiAccountData::Json(parsed) = &keyed.account.data else { continue };
            let info = &parsed.parsed["info"];
            let Some(mint) = info["mint"].as_str() else { continue };
            let amount = info["tokenAmount"]["amount"]
                .as_str()
                .and_then(|a| a.parse::<u64>().ok())
                .unwrap_or(0);
            if amount == 0 {
                continue;
            }
            holdings.push(TokenHolding {
                mint: mint.to_string(),
                account: Pubkey::from_str(&keyed.pubkey)?,
                amount,
            });
        }
        Ok(holdings)
    }

    async fn send_signed(&self, keypair: &Keypair, instructions: &[Instruction]) -> Result<String> {
        let blockhash = self
            .reader
            .get_latest_blockhash()
            .await
            .context("fetching blockhash for sweep")?;
        let message = Message::new(instructions, Some(&keypair.pubkey()));
        let tx = Transaction::new(&[keypair], message, blockhash);
        let raw = bincode::serialize(&VersionedTransaction::from(tx))?;
        self.pool.send_raw_transaction_quorum(&raw).await
    }
}

#[async_trait]
impl SweepExecutor for RpcSweeper {
    async fn sweep(&self, user_id: &str, wallet_id: &str, plan: &SweepPlan) -> Result<SweepReport> {
        let keypair = self.recover_keypair(user_id, wallet_id)?;
        let owner = keypair.pubkey();
        let dest = Pubkey::from_str(&plan.dest_pubkey).context("destination pubkey")?;

        let mut report = SweepReport::default();

        // Tokens first while SOL is still around for fees.
        if plan.sweep_tokens {
            let holdings = self.token_holdings(&owner).await?;
            for holding in holdings {
                if plan.exclude_mints.iter().any(|m| m == &holding.mint) {
                    debug!(mint = %holding.mint, "mint excluded from sweep");
                    continue;
                }
                let mint = Pubkey::from_str(&holding.mint)?;
                let dest_ata =
                    spl_associated_token_account::get_associated_token_address(&dest, &mint);
                let instructions = vec![
                    spl_associated_token_account::instruction::create_associated_token_account_idempotent(
                        &owner,
                        &dest,
                        &mint,
                        &spl_token::id(),
                    ),
                    spl_token::instruction::transfer(
                        &spl_token::id(),
                        &holding.account,
                        &dest_ata,
                        &owner,
                        &[],
                        holding.amount,
                    )?,
                ];
                match self.send_signed(&keypair, &instructions).await {
                    Ok(tx_hash) => {
                        report.token_accounts += 1;
                        report.tx_hashes.push(tx_hash);
                    }
                    Err(e) => warn!(mint = %holding.mint, "token sweep failed: {e:#}"),
                }
            }
        }

        let balance = self.reader.get_balance(&owner).await.context("fetching SOL balance")?;
        let send_lamports = balance.saturating_sub(plan.keep_lamports);
        if send_lamports > 0 {
            let instruction = system_instruction::transfer(&owner, &dest, send_lamports);
            let tx_hash = self.send_signed(&keypair, &[instruction]).await?;
            report.sol_lamports = send_lamports;
            report.tx_hashes.push(tx_hash);
        }

        info!(
            user = user_id,
            wallet = wallet_id,
            sol_lamports = report.sol_lamports,
            token_accounts = report.token_accounts,
            "sweep finished"
        );
        Ok(report)
    }
}
