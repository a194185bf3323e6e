//! CLI argument parsing using clap, plus the line grammar of the
//! interactive session.

use std::path::PathBuf;
use std::str::FromStr;

use clap::{Parser, Subcommand};
use rust_decimal::Decimal;

use crate::facade::Command;
use crate::types::OrderSide;

/// PerpDesk - order lifecycle and position engine for perpetual futures
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// The subcommand to execute
    #[command(subcommand)]
    pub command: Commands,

    /// Set the verbosity level (error, warn, info, debug, trace)
    #[arg(long, global = true, default_value = "info")]
    pub verbose: String,

    /// JSON configuration file; PERPDESK_* environment variables override it
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,
}

/// Available CLI commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Interactive session against the in-process paper exchange
    Paper {
        /// Starting wallet balance in USDT
        #[arg(long, default_value = "10000")]
        wallet: Decimal,

        /// Seed a mark price, e.g. --price BTCUSDT=50000 (repeatable)
        #[arg(long = "price", value_parser = parse_price_seed)]
        prices: Vec<(String, Decimal)>,
    },
}

fn parse_price_seed(raw: &str) -> Result<(String, Decimal), String> {
    let (symbol, price) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected SYMBOL=PRICE, got '{}'", raw))?;
    let price = Decimal::from_str(price.trim()).map_err(|e| format!("bad price '{}': {}", price, e))?;
    if price <= Decimal::ZERO {
        return Err(format!("price for {} must be positive", symbol));
    }
    Ok((symbol.trim().to_uppercase(), price))
}

/// Usage text printed by `help` in the interactive session.
pub const SESSION_HELP: &str = "\
commands:
  balance
  price <SYMBOL>
  info <SYMBOL>
  buy|sell <SYMBOL> <QTY> [reduce-only]
  limit buy|sell <SYMBOL> <QTY> <PRICE> [reduce-only]
  stop buy|sell <SYMBOL> <QTY> <PRICE> <STOP> [reduce-only]
  oco buy|sell <SYMBOL> <QTY> <TP_PRICE> <STOP> <STOP_LIMIT> [reduce-only]
  cancel <SYMBOL> <ORDER_ID>
  status <SYMBOL> <ORDER_ID>
  leverage <SYMBOL> <1-125>
  positions
  resubmit <CLIENT_TOKEN>
  sync <SYMBOL>
  validate
  clear-halt
  mark <SYMBOL> <PRICE>   (paper only: move the mark price)
  metrics
  quit";

/// One line typed into the interactive session.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionLine {
    Engine(Command),
    /// Move the paper exchange mark price
    Mark { symbol: String, price: Decimal },
    Metrics,
    Help,
    Quit,
    Empty,
}

struct Args<'a> {
    verb: &'a str,
    rest: std::str::SplitWhitespace<'a>,
}

impl<'a> Args<'a> {
    fn next(&mut self, what: &str) -> Result<&'a str, String> {
        self.rest
            .next()
            .ok_or_else(|| format!("{}: missing {}", self.verb, what))
    }

    fn symbol(&mut self) -> Result<String, String> {
        Ok(self.next("symbol")?.to_string())
    }

    fn decimal(&mut self, what: &str) -> Result<Decimal, String> {
        let raw = self.next(what)?;
        Decimal::from_str(raw).map_err(|_| format!("{}: {} '{}' is not a number", self.verb, what, raw))
    }

    fn side(&mut self) -> Result<OrderSide, String> {
        let raw = self.next("side")?;
        OrderSide::from_str(raw).map_err(|_| format!("{}: side must be buy or sell, got '{}'", self.verb, raw))
    }

    /// Optional trailing `reduce-only` marker of the order commands.
    fn reduce_only(&mut self) -> Result<bool, String> {
        match self.rest.next() {
            None => Ok(false),
            Some(word) if word.eq_ignore_ascii_case("reduce-only") => Ok(true),
            Some(extra) => Err(format!(
                "{}: unexpected argument '{}' (only 'reduce-only' may follow)",
                self.verb, extra
            )),
        }
    }

    fn finish(mut self) -> Result<(), String> {
        match self.rest.next() {
            None => Ok(()),
            Some(extra) => Err(format!("{}: unexpected argument '{}'", self.verb, extra)),
        }
    }
}

/// Parse one session line. Range and sign checks are left to the engine.
pub fn parse_line(line: &str) -> Result<SessionLine, String> {
    let mut words = line.split_whitespace();
    let Some(verb) = words.next() else {
        return Ok(SessionLine::Empty);
    };
    let verb_lower = verb.to_lowercase();
    let mut args = Args { verb, rest: words };

    let parsed = match verb_lower.as_str() {
        "balance" => SessionLine::Engine(Command::GetBalance),
        "price" => SessionLine::Engine(Command::GetPrice {
            symbol: args.symbol()?,
        }),
        "info" => SessionLine::Engine(Command::GetSymbolInfo {
            symbol: args.symbol()?,
        }),
        "buy" | "sell" => {
            let side = if verb_lower == "buy" { OrderSide::Buy } else { OrderSide::Sell };
            SessionLine::Engine(Command::PlaceMarket {
                symbol: args.symbol()?,
                side,
                quantity: args.decimal("quantity")?,
                reduce_only: args.reduce_only()?,
            })
        }
        "limit" => SessionLine::Engine(Command::PlaceLimit {
            side: args.side()?,
            symbol: args.symbol()?,
            quantity: args.decimal("quantity")?,
            price: args.decimal("price")?,
            reduce_only: args.reduce_only()?,
        }),
        "stop" => SessionLine::Engine(Command::PlaceStopLimit {
            side: args.side()?,
            symbol: args.symbol()?,
            quantity: args.decimal("quantity")?,
            price: args.decimal("price")?,
            stop_price: args.decimal("stop price")?,
            reduce_only: args.reduce_only()?,
        }),
        "oco" => SessionLine::Engine(Command::PlaceOco {
            side: args.side()?,
            symbol: args.symbol()?,
            quantity: args.decimal("quantity")?,
            price: args.decimal("take-profit price")?,
            stop_price: args.decimal("stop price")?,
            stop_limit_price: args.decimal("stop-limit price")?,
            reduce_only: args.reduce_only()?,
        }),
        "cancel" => SessionLine::Engine(Command::Cancel {
            symbol: args.symbol()?,
            exchange_id: args.next("order id")?.to_string(),
        }),
        "status" => SessionLine::Engine(Command::Status {
            symbol: args.symbol()?,
            exchange_id: args.next("order id")?.to_string(),
        }),
        "leverage" => {
            let symbol = args.symbol()?;
            let raw = args.next("leverage")?;
            let leverage = raw
                .parse::<i64>()
                .map_err(|_| format!("leverage: '{}' is not an integer", raw))?;
            SessionLine::Engine(Command::SetLeverage { symbol, leverage })
        }
        "positions" => SessionLine::Engine(Command::ListPositions),
        "resubmit" => SessionLine::Engine(Command::Resubmit {
            client_token: args.next("client token")?.to_string(),
        }),
        "sync" => SessionLine::Engine(Command::SyncOpenOrders {
            symbol: args.symbol()?,
        }),
        "validate" => SessionLine::Engine(Command::ValidateConnection),
        "clear-halt" => SessionLine::Engine(Command::ClearHalt),
        "mark" => SessionLine::Mark {
            symbol: args.symbol()?.to_uppercase(),
            price: args.decimal("price")?,
        },
        "metrics" => SessionLine::Metrics,
        "help" | "?" => SessionLine::Help,
        "quit" | "exit" => SessionLine::Quit,
        _ => return Err(format!("unknown command '{}' (try 'help')", verb)),
    };

    args.finish()?;
    Ok(parsed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_parse_market_and_limit() {
        assert_eq!(
            parse_line("buy BTCUSDT 0.001").unwrap(),
            SessionLine::Engine(Command::PlaceMarket {
                symbol: "BTCUSDT".into(),
                side: OrderSide::Buy,
                quantity: dec!(0.001),
                reduce_only: false,
            })
        );
        assert_eq!(
            parse_line("  LIMIT sell ethusdt 1 3100 ").unwrap(),
            SessionLine::Engine(Command::PlaceLimit {
                symbol: "ethusdt".into(),
                side: OrderSide::Sell,
                quantity: dec!(1),
                price: dec!(3100),
                reduce_only: false,
            })
        );
    }

    #[test]
    fn test_parse_reduce_only() {
        assert_eq!(
            parse_line("sell BTCUSDT 0.001 reduce-only").unwrap(),
            SessionLine::Engine(Command::PlaceMarket {
                symbol: "BTCUSDT".into(),
                side: OrderSide::Sell,
                quantity: dec!(0.001),
                reduce_only: true,
            })
        );
        assert_eq!(
            parse_line("stop buy BTCUSDT 0.002 51500 51000 REDUCE-ONLY").unwrap(),
            SessionLine::Engine(Command::PlaceStopLimit {
                symbol: "BTCUSDT".into(),
                side: OrderSide::Buy,
                quantity: dec!(0.002),
                price: dec!(51500),
                stop_price: dec!(51000),
                reduce_only: true,
            })
        );
        assert!(parse_line("limit sell BTCUSDT 1 3100 post-only")
            .unwrap_err()
            .contains("only 'reduce-only'"));
        assert!(parse_line("buy BTCUSDT 1 reduce-only extra")
            .unwrap_err()
            .contains("unexpected"));
    }

    #[test]
    fn test_parse_oco() {
        assert_eq!(
            parse_line("oco sell BTCUSDT 0.01 52000 48000 47900").unwrap(),
            SessionLine::Engine(Command::PlaceOco {
                symbol: "BTCUSDT".into(),
                side: OrderSide::Sell,
                quantity: dec!(0.01),
                price: dec!(52000),
                stop_price: dec!(48000),
                stop_limit_price: dec!(47900),
                reduce_only: false,
            })
        );
        assert!(matches!(
            parse_line("oco sell BTCUSDT 0.01 52000 48000 47900 reduce-only").unwrap(),
            SessionLine::Engine(Command::PlaceOco { reduce_only: true, .. })
        ));
    }

    #[test]
    fn test_negative_leverage_reaches_engine() {
        // sign and range checks belong to the facade
        assert_eq!(
            parse_line("leverage BTCUSDT -5").unwrap(),
            SessionLine::Engine(Command::SetLeverage {
                symbol: "BTCUSDT".into(),
                leverage: -5,
            })
        );
        assert!(parse_line("leverage BTCUSDT lots").is_err());
    }

    #[test]
    fn test_parse_errors() {
        assert!(parse_line("buy BTCUSDT").unwrap_err().contains("missing quantity"));
        assert!(parse_line("limit hold BTCUSDT 1 2").unwrap_err().contains("side"));
        assert!(parse_line("price BTCUSDT extra").unwrap_err().contains("unexpected"));
        assert!(parse_line("moon").unwrap_err().contains("unknown command"));
    }

    #[test]
    fn test_session_controls() {
        assert_eq!(parse_line("").unwrap(), SessionLine::Empty);
        assert_eq!(parse_line("quit").unwrap(), SessionLine::Quit);
        assert_eq!(parse_line("clear-halt").unwrap(), SessionLine::Engine(Command::ClearHalt));
        assert_eq!(
            parse_line("info ETHUSDT").unwrap(),
            SessionLine::Engine(Command::GetSymbolInfo {
                symbol: "ETHUSDT".into(),
            })
        );
        assert_eq!(
            parse_line("mark btcusdt 51000").unwrap(),
            SessionLine::Mark {
                symbol: "BTCUSDT".into(),
                price: dec!(51000),
            }
        );
    }

    #[test]
    fn test_price_seed_and_cli() {
        assert_eq!(
            parse_price_seed("btcusdt=50000").unwrap(),
            ("BTCUSDT".to_string(), dec!(50000))
        );
        assert!(parse_price_seed("BTCUSDT").is_err());
        assert!(parse_price_seed("BTCUSDT=-1").is_err());

        let cli = Cli::try_parse_from([
            "perpdesk",
            "paper",
            "--wallet",
            "500",
            "--price",
            "BTCUSDT=50000",
            "--price",
            "ETHUSDT=3000",
        ])
        .unwrap();
        let Commands::Paper { wallet, prices } = cli.command;
        assert_eq!(wallet, dec!(500));
        assert_eq!(prices.len(), 2);
    }
}
