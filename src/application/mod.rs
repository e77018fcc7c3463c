// Audit queue consumer
pub mod audit_sink;

// Conditional-order matching
pub mod conditional;

// Dividend withholding for Human-ETF issuers
pub mod dividend;

// Market execution and P2P settlement
pub mod executor;

// P2P matching for HUMAN tickers
pub mod human_matcher;

// Order validation and dispatch
pub mod intake;

// Short-equity watcher and forced liquidation
pub mod margin_watcher;
