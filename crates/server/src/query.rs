//! Command-line queries against the aggregator

use anyhow::{bail, Context};
use rust_decimal::Decimal;
use serde::Serialize;

use liquidity_core::ArbitrageFilter;
use liquidity_price_feed::{CancellationToken, LiquidityAggregator};

pub const USAGE: &str = "usage: liquidity-pool <best SYMBOL | all | symbols | arbitrage [MIN_PCT]>";

#[derive(Debug, Clone, PartialEq)]
pub enum Query {
    Best(String),
    All,
    Symbols,
    Arbitrage(Option<Decimal>),
}

impl Query {
    pub fn parse<I>(args: I) -> anyhow::Result<Self>
    where
        I: IntoIterator<Item = String>,
    {
        let mut args = args.into_iter();
        let command = args.next().unwrap_or_default().to_lowercase();

        let query = match command.as_str() {
            "best" => match args.next() {
                Some(symbol) => Query::Best(symbol),
                None => bail!("missing SYMBOL\n{}", USAGE),
            },
            "all" => Query::All,
            "symbols" => Query::Symbols,
            "arbitrage" => match args.next() {
                Some(min) => Query::Arbitrage(Some(
                    min.parse::<Decimal>()
                        .with_context(|| format!("invalid MIN_PCT {:?}", min))?,
                )),
                None => Query::Arbitrage(None),
            },
            "" => bail!("{}", USAGE),
            other => bail!("unknown command {:?}\n{}", other, USAGE),
        };

        if let Some(extra) = args.next() {
            bail!("unexpected argument {:?}\n{}", extra, USAGE);
        }
        Ok(query)
    }

    /// Run the query and render the result as pretty JSON
    pub async fn run(
        &self,
        aggregator: &LiquidityAggregator,
        cancel: &CancellationToken,
    ) -> anyhow::Result<String> {
        match self {
            Query::Best(symbol) => render(&aggregator.get_best_price(symbol, cancel).await?),
            Query::All => render(&aggregator.get_all_best_prices(cancel).await?),
            Query::Symbols => render(&aggregator.get_available_symbols(cancel).await?),
            Query::Arbitrage(None) => render(&aggregator.get_arbitrage_opportunities(cancel).await?),
            Query::Arbitrage(Some(min)) => {
                let filter = ArbitrageFilter::with_min_profit(*min);
                render(
                    &aggregator
                        .get_arbitrage_opportunities_matching(&filter, cancel)
                        .await?,
                )
            }
        }
    }
}

fn render<T: Serialize>(value: &T) -> anyhow::Result<String> {
    Ok(serde_json::to_string_pretty(value)?)
}
