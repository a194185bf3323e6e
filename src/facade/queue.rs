//! Message-passing command queue in front of [`CommandFacade`].
//!
//! Producers (the interactive CLI, an automated caller) hold a cloneable
//! [`CommandHandle`] and await a oneshot reply per command. The loop runs
//! each command in its own task, so a command stuck in a governor wait
//! never blocks unrelated ones.

use std::sync::Arc;

use rust_decimal::Decimal;
use tokio::sync::{mpsc, oneshot, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, Instrument};

use super::{CommandFacade, ConnectionReport};
use crate::error::EngineError;
use crate::exchange::{BalanceSnapshot, SymbolInfo};
use crate::orders::{OcoIntent, OcoPlacement, Order, OrderIntent, ScanReport};
use crate::positions::Position;
use crate::types::OrderSide;

const MAX_CONCURRENT_COMMANDS: usize = 16;

/// One operator command.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    GetBalance,
    GetPrice {
        symbol: String,
    },
    GetSymbolInfo {
        symbol: String,
    },
    PlaceMarket {
        symbol: String,
        side: OrderSide,
        quantity: Decimal,
        reduce_only: bool,
    },
    PlaceLimit {
        symbol: String,
        side: OrderSide,
        quantity: Decimal,
        price: Decimal,
        reduce_only: bool,
    },
    PlaceStopLimit {
        symbol: String,
        side: OrderSide,
        quantity: Decimal,
        price: Decimal,
        stop_price: Decimal,
        reduce_only: bool,
    },
    /// Both legs share `reduce_only`
    PlaceOco {
        symbol: String,
        side: OrderSide,
        quantity: Decimal,
        price: Decimal,
        stop_price: Decimal,
        stop_limit_price: Decimal,
        reduce_only: bool,
    },
    Cancel {
        symbol: String,
        exchange_id: String,
    },
    Status {
        symbol: String,
        exchange_id: String,
    },
    SetLeverage {
        symbol: String,
        leverage: i64,
    },
    ListPositions,
    Resubmit {
        client_token: String,
    },
    SyncOpenOrders {
        symbol: String,
    },
    ValidateConnection,
    ClearHalt,
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Self::GetBalance => "get_balance",
            Self::GetPrice { .. } => "get_price",
            Self::GetSymbolInfo { .. } => "get_symbol_info",
            Self::PlaceMarket { .. } => "place_market",
            Self::PlaceLimit { .. } => "place_limit",
            Self::PlaceStopLimit { .. } => "place_stop_limit",
            Self::PlaceOco { .. } => "place_oco",
            Self::Cancel { .. } => "cancel",
            Self::Status { .. } => "status",
            Self::SetLeverage { .. } => "set_leverage",
            Self::ListPositions => "list_positions",
            Self::Resubmit { .. } => "resubmit",
            Self::SyncOpenOrders { .. } => "sync_open_orders",
            Self::ValidateConnection => "validate_connection",
            Self::ClearHalt => "clear_halt",
        }
    }
}

/// Success payload of a command.
#[derive(Debug, Clone)]
pub enum CommandOutput {
    Balance(BalanceSnapshot),
    Price(Decimal),
    SymbolInfo(SymbolInfo),
    Order(Order),
    Orders(Vec<Order>),
    Oco(OcoPlacement),
    Position(Position),
    Positions(Vec<Position>),
    Scan(ScanReport),
    Connection(ConnectionReport),
    HaltCleared,
}

pub type CommandResult = Result<CommandOutput, EngineError>;

struct Envelope {
    command: Command,
    reply: oneshot::Sender<CommandResult>,
}

/// Producer side of the queue.
#[derive(Clone)]
pub struct CommandHandle {
    tx: mpsc::Sender<Envelope>,
}

/// Consumer side of the queue, handed to [`run_command_loop`].
pub struct CommandReceiver {
    rx: mpsc::Receiver<Envelope>,
}

pub fn command_channel(capacity: usize) -> (CommandHandle, CommandReceiver) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (CommandHandle { tx }, CommandReceiver { rx })
}

impl CommandHandle {
    /// Enqueue a command and wait for its result.
    pub async fn execute(&self, command: Command) -> CommandResult {
        let (reply, response) = oneshot::channel();
        let operation = command.name();
        self.tx
            .send(Envelope { command, reply })
            .await
            .map_err(|_| queue_failure(operation, "command loop stopped", false))?;
        // the command may have reached the exchange before its task died
        response
            .await
            .map_err(|_| queue_failure(operation, "command dropped before completion", true))?
    }
}

fn queue_failure(operation: &str, message: &str, unknown_outcome: bool) -> EngineError {
    EngineError::Transient {
        operation: operation.to_string(),
        message: message.to_string(),
        unknown_outcome,
        client_token: None,
    }
}

impl CommandFacade {
    /// Run one command against the facade.
    pub async fn dispatch(&self, command: Command) -> CommandResult {
        match command {
            Command::GetBalance => self.get_balance().await.map(CommandOutput::Balance),
            Command::GetPrice { symbol } => self.get_price(&symbol).await.map(CommandOutput::Price),
            Command::GetSymbolInfo { symbol } => {
                self.symbol_info(&symbol).await.map(CommandOutput::SymbolInfo)
            }
            Command::PlaceMarket {
                symbol,
                side,
                quantity,
                reduce_only,
            } => self
                .place(OrderIntent::market(symbol, side, quantity).with_reduce_only(reduce_only))
                .await
                .map(CommandOutput::Order),
            Command::PlaceLimit {
                symbol,
                side,
                quantity,
                price,
                reduce_only,
            } => self
                .place(OrderIntent::limit(symbol, side, quantity, price).with_reduce_only(reduce_only))
                .await
                .map(CommandOutput::Order),
            Command::PlaceStopLimit {
                symbol,
                side,
                quantity,
                price,
                stop_price,
                reduce_only,
            } => self
                .place(
                    OrderIntent::stop_limit(symbol, side, quantity, price, stop_price)
                        .with_reduce_only(reduce_only),
                )
                .await
                .map(CommandOutput::Order),
            Command::PlaceOco {
                symbol,
                side,
                quantity,
                price,
                stop_price,
                stop_limit_price,
                reduce_only,
            } => self
                .place_oco_intent(OcoIntent {
                    symbol,
                    side,
                    quantity,
                    take_profit_price: price,
                    stop_price,
                    stop_limit_price,
                    reduce_only,
                })
                .await
                .map(CommandOutput::Oco),
            Command::Cancel {
                symbol,
                exchange_id,
            } => self
                .cancel(&symbol, &exchange_id)
                .await
                .map(CommandOutput::Orders),
            Command::Status {
                symbol,
                exchange_id,
            } => self
                .status(&symbol, &exchange_id)
                .await
                .map(CommandOutput::Order),
            Command::SetLeverage { symbol, leverage } => self
                .set_leverage(&symbol, leverage)
                .await
                .map(CommandOutput::Position),
            Command::ListPositions => self.list_positions().await.map(CommandOutput::Positions),
            Command::Resubmit { client_token } => {
                self.resubmit(&client_token).await.map(CommandOutput::Order)
            }
            Command::SyncOpenOrders { symbol } => {
                self.sync_open_orders(&symbol).await.map(CommandOutput::Scan)
            }
            Command::ValidateConnection => self
                .validate_connection()
                .await
                .map(CommandOutput::Connection),
            Command::ClearHalt => {
                self.clear_halt().await;
                Ok(CommandOutput::HaltCleared)
            }
        }
    }
}

/// Consume commands until every [`CommandHandle`] is dropped, then wait for
/// in-flight commands to finish.
pub async fn run_command_loop(facade: Arc<CommandFacade>, mut commands: CommandReceiver) {
    let semaphore = Arc::new(Semaphore::new(MAX_CONCURRENT_COMMANDS));
    let mut in_flight: JoinSet<()> = JoinSet::new();
    info!("Command loop started");

    loop {
        tokio::select! {
            envelope = commands.rx.recv() => {
                let Some(Envelope { command, reply }) = envelope else {
                    info!(in_flight = in_flight.len(), "Command queue closed, draining");
                    break;
                };

                // backpressure: wait for a slot before taking the next command
                let Ok(permit) = semaphore.clone().acquire_owned().await else {
                    break;
                };
                let facade = facade.clone();
                let span = tracing::info_span!("command", name = command.name());
                in_flight.spawn(
                    async move {
                        let _permit = permit;
                        let result = facade.dispatch(command).await;
                        if let Err(e) = &result {
                            debug!(error_kind = %e.kind(), error = %e, "Command failed");
                        }
                        if reply.send(result).is_err() {
                            debug!("Command caller went away before the reply");
                        }
                    }
                    .instrument(span),
                );
            }

            Some(joined) = in_flight.join_next() => {
                if let Err(join_err) = joined {
                    if join_err.is_panic() {
                        error!("CRITICAL: Command task panicked: {:?}", join_err);
                    }
                }
            }
        }
    }

    while let Some(joined) = in_flight.join_next().await {
        if let Err(join_err) = joined {
            if join_err.is_panic() {
                error!("CRITICAL: Command task panicked: {:?}", join_err);
            }
        }
    }
    info!("Command loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::error::ErrorKind;
    use crate::exchange::PaperExchange;
    use crate::resilience::RetryPolicy;
    use rust_decimal_macros::dec;

    fn spawn_loop() -> (CommandHandle, tokio::task::JoinHandle<()>) {
        let (paper, _events) = PaperExchange::new(dec!(10000));
        paper.set_price("BTCUSDT", dec!(50000));
        let mut config = EngineConfig::default();
        config.retry = RetryPolicy::immediate(2);
        let facade = Arc::new(CommandFacade::new(Arc::new(paper), &config));
        let (handle, receiver) = command_channel(8);
        (handle, tokio::spawn(run_command_loop(facade, receiver)))
    }

    #[tokio::test]
    async fn test_commands_round_trip_through_queue() {
        let (handle, task) = spawn_loop();

        match handle
            .execute(Command::GetPrice {
                symbol: "BTCUSDT".into(),
            })
            .await
            .unwrap()
        {
            CommandOutput::Price(p) => assert_eq!(p, dec!(50000)),
            other => panic!("unexpected {:?}", other),
        }

        let err = handle
            .execute(Command::SetLeverage {
                symbol: "BTCUSDT".into(),
                leverage: 200,
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidOrderParameters);

        drop(handle);
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_concurrent_callers() {
        let (handle, task) = spawn_loop();

        let mut callers = JoinSet::new();
        for _ in 0..4 {
            let handle = handle.clone();
            callers.spawn(async move {
                handle
                    .execute(Command::PlaceMarket {
                        symbol: "BTCUSDT".into(),
                        side: OrderSide::Buy,
                        quantity: dec!(0.001),
                        reduce_only: false,
                    })
                    .await
            });
        }
        while let Some(result) = callers.join_next().await {
            assert!(matches!(result.unwrap(), Ok(CommandOutput::Order(_))));
        }

        match handle.execute(Command::ListPositions).await.unwrap() {
            CommandOutput::Positions(p) => assert_eq!(p[0].signed_quantity, dec!(0.004)),
            other => panic!("unexpected {:?}", other),
        }

        drop(handle);
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_reduce_only_flag_reaches_exchange() {
        let (handle, task) = spawn_loop();
        let sell = |quantity| Command::PlaceMarket {
            symbol: "BTCUSDT".into(),
            side: OrderSide::Sell,
            quantity,
            reduce_only: true,
        };

        // nothing to reduce while flat
        let err = handle.execute(sell(dec!(0.001))).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Rejected);

        handle
            .execute(Command::PlaceMarket {
                symbol: "BTCUSDT".into(),
                side: OrderSide::Buy,
                quantity: dec!(0.002),
                reduce_only: false,
            })
            .await
            .unwrap();
        match handle.execute(sell(dec!(0.001))).await.unwrap() {
            CommandOutput::Order(order) => assert!(order.reduce_only),
            other => panic!("unexpected {:?}", other),
        }

        drop(handle);
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_stopped_loop_is_not_fatal() {
        let (handle, receiver) = command_channel(1);
        drop(receiver);
        let err = handle.execute(Command::GetBalance).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Transient);
        // the command never left the queue
        assert!(!err.is_unknown_outcome());
    }
}
