use std::sync::Arc;

use clap::Parser;
use rust_decimal::Decimal;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};

use perpdesk::cli::{parse_line, Cli, Commands, SessionLine, SESSION_HELP};
use perpdesk::config::EngineConfig;
use perpdesk::exchange::PaperExchange;
use perpdesk::facade::{
    command_channel, run_command_loop, CommandFacade, CommandHandle, CommandOutput, CommandResult,
};
use perpdesk::orders::Order;
use perpdesk::{logging, metrics};

const COMMAND_QUEUE_CAPACITY: usize = 64;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    if let Err(e) = logging::init(&cli.verbose) {
        eprintln!("Failed to initialise logging: {}", e);
    }

    let config = EngineConfig::load(cli.config.as_deref())?;
    info!(
        requests_per_second = config.governor.requests_per_second,
        max_attempts = config.retry.max_attempts,
        reconcile_interval_secs = config.reconciliation.interval_secs,
        "Configuration loaded"
    );

    match cli.command {
        Commands::Paper { wallet, prices } => run_paper_session(config, wallet, prices).await,
    }
}

async fn run_paper_session(
    config: EngineConfig,
    wallet: Decimal,
    prices: Vec<(String, Decimal)>,
) -> Result<(), Box<dyn std::error::Error>> {
    let (paper, events) = PaperExchange::new(wallet);
    if prices.is_empty() {
        warn!("No --price seeds given; only symbols set with 'mark' are tradable");
    }
    for (symbol, price) in &prices {
        paper.set_price(symbol, *price);
    }
    let paper = Arc::new(paper);

    let facade = Arc::new(CommandFacade::new(paper.clone(), &config));
    if let Err(e) = facade.startup_reconcile().await {
        error!(error = %e, "Startup reconciliation failed");
    }
    let reconcile_task = facade.start_background_reconciliation();

    let pump_facade = facade.clone();
    let pump_task = tokio::spawn(async move { pump_facade.run_event_pump(events).await });

    let (handle, receiver) = command_channel(COMMAND_QUEUE_CAPACITY);
    let loop_task = tokio::spawn(run_command_loop(facade.clone(), receiver));

    println!("perpdesk paper session (wallet {} USDT). Type 'help' for commands.", wallet);
    read_session(&handle, &paper).await?;

    drop(handle);
    if let Err(e) = loop_task.await {
        error!("Command loop task failed: {:?}", e);
    }
    if let Some(task) = reconcile_task {
        task.abort();
    }
    pump_task.abort();
    info!("Session closed");
    Ok(())
}

async fn read_session(handle: &CommandHandle, paper: &PaperExchange) -> Result<(), Box<dyn std::error::Error>> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        match parse_line(&line) {
            Ok(SessionLine::Engine(command)) => print_result(handle.execute(command).await),
            Ok(SessionLine::Mark { symbol, price }) => {
                paper.set_price(&symbol, price);
                println!("{} mark set to {}", symbol, price);
            }
            Ok(SessionLine::Metrics) => print!("{}", metrics::gather_metrics()),
            Ok(SessionLine::Help) => println!("{}", SESSION_HELP),
            Ok(SessionLine::Quit) => break,
            Ok(SessionLine::Empty) => {}
            Err(message) => println!("error: {}", message),
        }
    }
    Ok(())
}

fn describe(order: &Order) -> String {
    let exchange_id = order
        .exchange_id
        .as_ref()
        .map(|id| id.to_string())
        .unwrap_or_else(|| "-".to_string());
    let mut line = format!(
        "{} {} {} qty={} filled={} state={} id={} token={}",
        order.symbol,
        order.side,
        order.order_type,
        order.fill.quantity,
        order.fill.filled_qty,
        order.state,
        exchange_id,
        order.client_token,
    );
    if let Some(tif) = order.time_in_force {
        line.push_str(&format!(" tif={}", tif));
    }
    if order.reduce_only {
        line.push_str(" reduce-only");
    }
    if let Some(price) = order.price {
        line.push_str(&format!(" price={}", price));
    }
    if let Some(stop) = order.stop_price {
        line.push_str(&format!(" stop={}", stop));
    }
    if let Some(avg) = order.fill.avg_fill_price {
        line.push_str(&format!(" avg={}", avg));
    }
    if let Some(group) = &order.linked_group_id {
        line.push_str(&format!(" group={}", group));
    }
    if let Some(reason) = &order.reject_reason {
        line.push_str(&format!(" reason=\"{}\"", reason));
    }
    line
}

fn print_result(result: CommandResult) {
    match result {
        Ok(CommandOutput::Balance(b)) => println!(
            "wallet={} margin={} unrealized={} available={} max_withdraw={}",
            b.total_wallet_balance,
            b.total_margin_balance,
            b.total_unrealized_profit,
            b.available_balance,
            b.max_withdraw_amount
        ),
        Ok(CommandOutput::Price(p)) => println!("{}", p),
        Ok(CommandOutput::SymbolInfo(i)) => println!(
            "{} status={} tick={} min_price={} step={} min_qty={} max_qty={} min_notional={}",
            i.symbol, i.status, i.tick_size, i.min_price, i.step_size, i.min_qty, i.max_qty, i.min_notional
        ),
        Ok(CommandOutput::Order(o)) => println!("{}", describe(&o)),
        Ok(CommandOutput::Orders(orders)) => {
            for o in &orders {
                println!("{}", describe(o));
            }
        }
        Ok(CommandOutput::Oco(placement)) => {
            println!("group {}", placement.group_id);
            println!("  take-profit: {}", describe(&placement.take_profit));
            println!("  stop-loss:   {}", describe(&placement.stop_loss));
        }
        Ok(CommandOutput::Position(p)) => println!(
            "{} qty={} entry={} leverage={}x",
            p.symbol, p.signed_quantity, p.entry_price, p.leverage
        ),
        Ok(CommandOutput::Positions(positions)) => {
            if positions.is_empty() {
                println!("no open positions");
            }
            for p in &positions {
                println!(
                    "{} qty={} entry={} mark={} upnl={} leverage={}x",
                    p.symbol, p.signed_quantity, p.entry_price, p.mark_price, p.unrealized_pnl, p.leverage
                );
            }
        }
        Ok(CommandOutput::Scan(report)) => println!(
            "refreshed={} adopted={} unresolved={}",
            report.refreshed,
            report.adopted.len(),
            report.unresolved.len()
        ),
        Ok(CommandOutput::Connection(c)) => println!(
            "server_time={} skew={}ms available={}",
            c.server_time, c.clock_skew_ms, c.balance.available_balance
        ),
        Ok(CommandOutput::HaltCleared) => println!("trading halt cleared"),
        Err(e) => {
            println!("error [{}]: {}", e.kind(), e);
            if e.is_unknown_outcome() {
                println!("outcome unknown: run 'status' or 'resubmit <CLIENT_TOKEN>' before retrying");
            }
        }
    }
}
