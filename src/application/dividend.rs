//! Dividend withholding for Human-ETF issuers.
//!
//! When an issuer with a positive dividend rate realizes trading profit,
//! part of it is withheld from the sale proceeds and distributed pro-rata
//! to the holders of their instrument, inside the same settlement
//! transaction. Payouts floor to whole currency units; the flooring
//! remainder is extinguished rather than returned.

use crate::domain::asset::User;
use crate::domain::errors::EngineError;
use crate::domain::events::HumanEvent;
use crate::domain::types::WALLET_REASON_DIVIDEND;
use crate::infrastructure::persistence::ledger::LedgerTx;
use rust_decimal::Decimal;
use tracing::{info, warn};

/// Outcome of a withholding pass: how much left the seller's proceeds, and
/// the event to publish once the transaction commits.
#[derive(Debug, Clone)]
pub struct Withholding {
    pub withheld: Decimal,
    pub event: HumanEvent,
}

pub struct DividendService;

impl DividendService {
    /// Withholds `pnl * dividend_rate` (clamped to `cap`, the distributable
    /// proceeds) and credits the issuer's shareholders. Returns None when
    /// nothing is owed or nobody holds the instrument.
    pub async fn withhold(
        tx: &mut LedgerTx,
        payer: &User,
        pnl: Decimal,
        cap: Decimal,
    ) -> Result<Option<Withholding>, EngineError> {
        if pnl <= Decimal::ZERO || payer.dividend_rate <= Decimal::ZERO {
            return Ok(None);
        }

        let ticker_id = payer.human_ticker_id();
        let shareholders = tx.shareholders(&ticker_id, payer.id).await?;
        if shareholders.is_empty() {
            return Ok(None);
        }

        let total_shares: Decimal = shareholders.iter().map(|s| s.quantity).sum();
        if total_shares <= Decimal::ZERO {
            return Ok(None);
        }

        let mut total_dividend = pnl * payer.dividend_rate;
        if total_dividend > cap {
            warn!(
                payer_id = %payer.id,
                owed = %total_dividend,
                cap = %cap,
                "Dividend clamped to distributable proceeds"
            );
            total_dividend = cap;
        }
        if total_dividend <= Decimal::ZERO {
            return Ok(None);
        }

        let mut distributed = Decimal::ZERO;
        for shareholder in &shareholders {
            let payout = (total_dividend * shareholder.quantity / total_shares).floor();
            if payout <= Decimal::ZERO {
                continue;
            }

            let Some(wallet) = tx.lock_wallet(shareholder.user_id).await? else {
                warn!(user_id = %shareholder.user_id, "Shareholder has no wallet; payout skipped");
                continue;
            };
            tx.set_wallet_balance(&wallet, wallet.balance + payout, WALLET_REASON_DIVIDEND)
                .await?;
            tx.record_dividend(payer.id, shareholder.user_id, &ticker_id, payout)
                .await?;
            distributed += payout;
        }

        info!(
            payer_id = %payer.id,
            ticker_id = %ticker_id,
            withheld = %total_dividend,
            distributed = %distributed,
            "Dividend withheld from realized profit"
        );

        Ok(Some(Withholding {
            withheld: total_dividend,
            event: HumanEvent::DividendPaid {
                payer_id: payer.id,
                ticker_id,
                total_dividend,
            },
        }))
    }
}
