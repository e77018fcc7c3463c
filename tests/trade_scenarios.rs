//! Scenario tests composing the settlement, matching, and margin math the
//! way the services drive it at runtime.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use simbroker::domain::margin::{assess_equity, requires_liquidation};
use simbroker::domain::matching::{
    initial_trailing_stop, limit_triggered, next_trailing_stop, plan_p2p_match, stop_triggered,
    NoMatch,
};
use simbroker::domain::order::{Order, OrderRequest};
use simbroker::domain::settlement::{settle, SettlementInput};
use simbroker::domain::types::{OrderSide, OrderType};
use std::collections::HashMap;
use uuid::Uuid;

fn settle_input(
    side: OrderSide,
    price: Decimal,
    qty: Decimal,
    fee_rate: Decimal,
    balance: Decimal,
    pos_qty: Decimal,
    avg: Decimal,
) -> SettlementInput {
    SettlementInput {
        side,
        price,
        quantity: qty,
        fee_rate,
        balance,
        position_qty: pos_qty,
        average_price: avg,
    }
}

/// Market long round trip at fee 0.001: buy 10 @ 100, sell 10 @ 120.
#[test]
fn scenario_market_long_round_trip() {
    let fee = dec!(0.001);
    let mut balance = dec!(1000000);

    let buy = settle(settle_input(
        OrderSide::Buy,
        dec!(100),
        dec!(10),
        fee,
        balance,
        dec!(0),
        dec!(0),
    ))
    .unwrap();
    balance += buy.wallet_delta;

    assert_eq!(balance, dec!(998999));
    assert_eq!(buy.new_quantity, dec!(10));
    assert_eq!(buy.new_average_price, dec!(100.1));

    let sell = settle(settle_input(
        OrderSide::Sell,
        dec!(120),
        dec!(10),
        fee,
        balance,
        buy.new_quantity,
        buy.new_average_price,
    ))
    .unwrap();
    balance += sell.wallet_delta;

    assert_eq!(sell.fee, dec!(1.2));
    assert_eq!(sell.realized_pnl, Some(dec!(197.8)));
    assert_eq!(balance, dec!(1000197.8));
    assert!(sell.delete_position);
}

/// Switching long to short in a single oversized sell.
#[test]
fn scenario_switch_long_to_short() {
    let s = settle(settle_input(
        OrderSide::Sell,
        dec!(100),
        dec!(5),
        dec!(0),
        dec!(0),
        dec!(2),
        dec!(100),
    ))
    .unwrap();

    assert_eq!(s.realized_pnl, Some(dec!(0)));
    assert_eq!(s.new_quantity, dec!(-3));
    assert_eq!(s.new_average_price, dec!(100));
    assert_eq!(s.wallet_delta, dec!(500));
}

/// A resting limit buy fires on the first tick satisfying target >= tick.
#[test]
fn scenario_limit_buy_trigger_sequence() {
    let target = dec!(100);
    let ticks = [dec!(110), dec!(105), dec!(101), dec!(99)];

    let fired: Vec<Decimal> = ticks
        .iter()
        .copied()
        .filter(|tick| limit_triggered(OrderSide::Buy, target, *tick))
        .collect();

    assert_eq!(fired, vec![dec!(99)]);
}

/// Stop-limit promotion: the stop leg fires at 88, the promoted limit rests
/// and only fills on the next tick satisfying the limit condition.
#[test]
fn scenario_stop_limit_promotion() {
    let stop = dec!(90);
    let target = dec!(89);

    // Tick 88: the stop condition holds, promotion happens, no fill yet.
    assert!(stop_triggered(OrderSide::Sell, stop, dec!(88)));

    // Next tick 89: now evaluated as a LIMIT SELL, target <= tick fills.
    assert!(limit_triggered(OrderSide::Sell, target, dec!(89)));
    // A tick below the target would not.
    assert!(!limit_triggered(OrderSide::Sell, target, dec!(88.5)));
}

/// Trailing stop sell, gap 5, placed at 100: ratchets to 105 on the 110
/// tick, holds at 108, triggers at 104.
#[test]
fn scenario_trailing_stop_lifecycle() {
    let gap = dec!(5);
    let mut stop = initial_trailing_stop(OrderSide::Sell, dec!(100), gap);
    assert_eq!(stop, dec!(95));

    if let Some(next) = next_trailing_stop(OrderSide::Sell, dec!(110), gap, stop) {
        stop = next;
    }
    assert_eq!(stop, dec!(105));

    assert_eq!(next_trailing_stop(OrderSide::Sell, dec!(108), gap, stop), None);
    assert!(!stop_triggered(OrderSide::Sell, stop, dec!(108)));

    assert!(stop_triggered(OrderSide::Sell, stop, dec!(104)));
}

fn human_order(
    side: OrderSide,
    order_type: OrderType,
    target: Option<Decimal>,
    qty: Decimal,
    age_secs: i64,
) -> Order {
    let req = OrderRequest {
        ticker_id: "HUMAN-issuer".to_string(),
        side,
        order_type,
        quantity: qty,
        target_price: target,
        stop_price: None,
        trailing_gap: None,
        idempotency_key: None,
    };
    let mut order = Order::pending(Uuid::new_v4(), Uuid::new_v4(), &req);
    order.created_at = chrono::Utc::now() - chrono::Duration::seconds(age_secs);
    order
}

/// Two buys at the same price: the older fills, the newer rests.
#[test]
fn scenario_p2p_time_priority() {
    let b1 = human_order(OrderSide::Buy, OrderType::Limit, Some(dec!(100)), dec!(1), 60);
    let b2 = human_order(OrderSide::Buy, OrderType::Limit, Some(dec!(100)), dec!(1), 30);
    let s1 = human_order(OrderSide::Sell, OrderType::Limit, Some(dec!(100)), dec!(1), 10);

    let book = vec![b2.clone(), b1.clone(), s1.clone()];
    let plan = plan_p2p_match(&book).unwrap();

    assert_eq!(plan.buy_order_id, b1.id);
    assert_eq!(plan.quantity, dec!(1));

    // After B1 fills completely, only B2 remains and still crosses nothing.
    let rest = vec![b2];
    assert_eq!(plan_p2p_match(&rest), Err(NoMatch::NoCross));
}

/// P2P partial fills walk the book in order.
#[test]
fn scenario_p2p_partial_fill_drain() {
    let big_buy = human_order(OrderSide::Buy, OrderType::Limit, Some(dec!(100)), dec!(5), 60);
    let s1 = human_order(OrderSide::Sell, OrderType::Limit, Some(dec!(99)), dec!(2), 30);
    let s2 = human_order(OrderSide::Sell, OrderType::Limit, Some(dec!(100)), dec!(4), 10);

    let mut book = vec![big_buy.clone(), s1.clone(), s2.clone()];

    // First round: the cheapest sell matches 2 units; the older buy is the
    // maker and sets the price.
    let plan = plan_p2p_match(&book).unwrap();
    assert_eq!(plan.sell_order_id, s1.id);
    assert_eq!(plan.quantity, dec!(2));
    assert_eq!(plan.price, dec!(100));

    // Apply the fill and re-plan, as the matcher's drain loop does.
    book.retain(|o| o.id != s1.id);
    for order in book.iter_mut() {
        if order.id == big_buy.id {
            order.unfilled_quantity -= dec!(2);
        }
    }
    let plan = plan_p2p_match(&book).unwrap();
    assert_eq!(plan.sell_order_id, s2.id);
    assert_eq!(plan.quantity, dec!(3));
}

/// Margin liquidation: short 100 @ 10,000 with the price at 19,500 breaches
/// maintenance, and closing at market leaves exactly the residual cash.
#[test]
fn scenario_margin_liquidation() {
    let user = Uuid::new_v4();
    let positions = vec![simbroker::domain::asset::Position {
        user_id: user,
        ticker_id: "CRYPTO-MEME".to_string(),
        quantity: dec!(-100),
        average_price: dec!(10000),
    }];
    let mut prices = HashMap::new();
    prices.insert("CRYPTO-MEME".to_string(), dec!(19500));

    let balance = dec!(2000000);
    let breakdown = assess_equity(balance, &positions, &prices);
    assert_eq!(breakdown.short_liability, dec!(1950000));
    assert_eq!(breakdown.net_equity, dec!(50000));
    assert!(requires_liquidation(&breakdown));

    // Mark-to-market close: proceeds = qty * price = -1,950,000.
    let proceeds: Decimal = positions
        .iter()
        .map(|p| p.quantity * prices[&p.ticker_id])
        .sum();
    let final_balance = (balance + proceeds).max(Decimal::ZERO);
    assert_eq!(final_balance, dec!(50000));
}

/// Ledger conservation: zero-fee trades between two users move cash and
/// inventory without creating either.
#[test]
fn scenario_zero_fee_conservation() {
    let price = dec!(100);
    let market_price = dec!(100);

    // A starts with 10 units at avg 100 and no cash; B starts flat with cash.
    let mut a_balance = dec!(0);
    let mut a_qty = dec!(10);
    let mut a_avg = dec!(100);
    let mut b_balance = dec!(5000);
    let mut b_qty = dec!(0);
    let mut b_avg = dec!(0);

    let total_before = a_balance + b_balance + (a_qty + b_qty) * market_price;

    for qty in [dec!(4), dec!(6)] {
        let sell = settle(settle_input(
            OrderSide::Sell,
            price,
            qty,
            dec!(0),
            a_balance,
            a_qty,
            a_avg,
        ))
        .unwrap();
        a_balance += sell.wallet_delta;
        a_qty = sell.new_quantity;
        a_avg = sell.new_average_price;

        let buy = settle(settle_input(
            OrderSide::Buy,
            price,
            qty,
            dec!(0),
            b_balance,
            b_qty,
            b_avg,
        ))
        .unwrap();
        b_balance += buy.wallet_delta;
        b_qty = buy.new_quantity;
        b_avg = buy.new_average_price;
    }

    let total_after = a_balance + b_balance + (a_qty + b_qty) * market_price;
    assert_eq!(total_before, total_after);
    assert_eq!(a_qty, dec!(0));
    assert_eq!(b_qty, dec!(10));
}
