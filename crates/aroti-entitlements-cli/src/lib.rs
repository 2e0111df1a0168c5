//! Command surface for the entitlement engine.
//!
//! Hosts embed it through:
//! - [`run_cli`] for full parsed CLI execution.
//! - [`run_entitlements_with_db`] for a parsed [`Command`] against a DB path.
//! - [`run_entitlements`] for execution against an existing
//!   [`SqliteEntitlementStore`].

use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use aroti_entitlements_core::{
    format_date, format_rfc3339, now_utc, parse_rfc3339_utc, AccessContext, AccessDecision,
    ContentRef, DailyPoints, EntitlementEngine, EntitlementPolicy, Milestone, Transaction, UserId,
    ACTIVITY_PRACTICE, ACTIVITY_QUIZ, ACTIVITY_SPREAD,
};
use aroti_entitlements_store_sqlite::SqliteEntitlementStore;
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde_json::json;
use time::OffsetDateTime;
use tracing::debug;

#[derive(Debug, Parser)]
#[command(name = "aroti")]
#[command(about = "Aroti entitlement and progression CLI")]
pub struct Cli {
    #[arg(long, default_value = "./aroti_entitlements.sqlite3", global = true)]
    db: PathBuf,

    #[command(flatten)]
    session: SessionArgs,

    #[command(subcommand)]
    command: Command,
}

/// Who is acting, when, and with which subscription state.
#[derive(Debug, Clone, Default, Args)]
pub struct SessionArgs {
    #[arg(long, global = true)]
    pub user: Option<String>,
    /// RFC3339 instant used as "now"; defaults to the current time.
    #[arg(long, global = true)]
    pub as_of: Option<String>,
    #[arg(long, global = true)]
    pub premium: bool,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    Access {
        #[command(subcommand)]
        command: Box<AccessCommand>,
    },
    Quota {
        #[command(subcommand)]
        command: Box<QuotaCommand>,
    },
    Points {
        #[command(subcommand)]
        command: Box<PointsCommand>,
    },
    Unlock {
        #[command(subcommand)]
        command: Box<UnlockCommand>,
    },
    Activity {
        #[command(subcommand)]
        command: Box<ActivityCommand>,
    },
    Journey {
        #[command(subcommand)]
        command: Box<JourneyCommand>,
    },
    Policy {
        #[command(subcommand)]
        command: Box<PolicyCommand>,
    },
}

#[derive(Debug, Subcommand)]
pub enum AccessCommand {
    Check(CheckArgs),
    RecordUsage(FeatureArgs),
    SpendUnlock(FeatureArgs),
    SpendOverflow(FeatureArgs),
}

#[derive(Debug, Subcommand)]
pub enum QuotaCommand {
    Show(FeatureArgs),
}

#[derive(Debug, Subcommand)]
pub enum PointsCommand {
    Earn(EarnArgs),
    Spend(SpendArgs),
    Balance,
    History(HistoryArgs),
}

#[derive(Debug, Subcommand)]
pub enum UnlockCommand {
    Add(ContentArgs),
    Check(ContentArgs),
    List(ListArgs),
}

#[derive(Debug, Subcommand)]
pub enum ActivityCommand {
    Record(RecordActivityArgs),
    Complete(CompleteArgs),
    Metered(FeatureArgs),
    Streak,
    Last7(TableArgs),
    Today,
}

#[derive(Debug, Subcommand)]
pub enum JourneyCommand {
    Level,
    Milestones(TableArgs),
    Summary,
}

#[derive(Debug, Subcommand)]
pub enum PolicyCommand {
    Show(ShowPolicyArgs),
    Load(LoadPolicyArgs),
}

#[derive(Debug, Args)]
pub struct FeatureArgs {
    #[arg(long)]
    feature: String,
}

#[derive(Debug, Args)]
pub struct CheckArgs {
    #[arg(long)]
    feature: String,
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
pub struct EarnArgs {
    #[arg(long)]
    event: String,
    #[arg(long)]
    amount: u32,
}

#[derive(Debug, Args)]
pub struct SpendArgs {
    #[arg(long)]
    event: String,
    #[arg(long)]
    cost: u32,
}

#[derive(Debug, Args)]
pub struct HistoryArgs {
    #[arg(long, default_value_t = 20)]
    limit: usize,
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
pub struct ContentArgs {
    /// Content reference such as `tarotSpread:celtic-cross`.
    #[arg(long)]
    content: String,
}

#[derive(Debug, Args)]
pub struct ListArgs {
    #[arg(long, default_value_t = 5)]
    limit: usize,
}

#[derive(Debug, Args)]
pub struct RecordActivityArgs {
    #[arg(long)]
    activity_type: String,
    #[arg(long, default_value_t = 0)]
    points: u32,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum ActivityKindArg {
    Practice,
    Spread,
    Quiz,
}

#[derive(Debug, Args)]
pub struct CompleteArgs {
    #[arg(long, value_enum)]
    kind: ActivityKindArg,
    #[arg(long)]
    event: String,
    #[arg(long)]
    points: u32,
}

#[derive(Debug, Args)]
pub struct TableArgs {
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
pub struct ShowPolicyArgs {
    #[arg(long)]
    version: Option<u32>,
}

#[derive(Debug, Args)]
pub struct LoadPolicyArgs {
    #[arg(long)]
    file: PathBuf,
}

/// Executes a fully parsed CLI invocation.
///
/// # Errors
/// Returns an error when store open/migrate fails or the requested command fails.
pub fn run_cli(cli: Cli) -> Result<()> {
    run_entitlements_with_db(&cli.db, &cli.session, cli.command)
}

/// Executes a parsed command using the provided `SQLite` DB path.
///
/// # Errors
/// Returns an error when store open/migrate fails or the requested command fails.
pub fn run_entitlements_with_db(
    db_path: &Path,
    session: &SessionArgs,
    command: Command,
) -> Result<()> {
    let store = SqliteEntitlementStore::open(db_path)?;
    store.migrate()?;
    run_entitlements(command, session, &store)
}

/// Executes a parsed command against an existing store handle, using the
/// newest stored policy.
///
/// # Errors
/// Returns an error when session arguments are invalid, the stored policy
/// cannot be compiled, or the engine rejects the operation.
pub fn run_entitlements(
    command: Command,
    session: &SessionArgs,
    store: &SqliteEntitlementStore,
) -> Result<()> {
    if let Command::Policy { command } = command {
        return run_policy(*command, store);
    }

    let policy = store.latest_policy()?;
    debug!(policy_version = policy.policy_version, "loaded policy");
    let engine = EntitlementEngine::new(store, &policy)?;
    let user = engine.user(session.user_id()?);
    let as_of = parse_optional_utc(session.as_of.as_deref())?;
    let ctx = AccessContext::new(session.premium, as_of);

    match command {
        Command::Access { command } => match *command {
            AccessCommand::Check(args) => {
                let decision = user.check_access(&args.feature, &ctx)?;
                if args.json {
                    print_json(&decision)
                } else {
                    print_decision_table(&decision);
                    Ok(())
                }
            }
            AccessCommand::RecordUsage(args) => {
                print_json(&user.record_usage(&args.feature, &ctx)?)
            }
            AccessCommand::SpendUnlock(args) => {
                print_json(&user.spend_for_unlock(&args.feature, &ctx)?)
            }
            AccessCommand::SpendOverflow(args) => {
                print_json(&user.spend_for_overflow(&args.feature, &ctx)?)
            }
        },
        Command::Quota { command } => match *command {
            QuotaCommand::Show(args) => print_json(&user.get_usage(&args.feature, as_of)?),
        },
        Command::Points { command } => match *command {
            PointsCommand::Earn(args) => {
                print_json(&user.earn_points(&args.event, args.amount, as_of)?)
            }
            PointsCommand::Spend(args) => {
                print_json(&user.spend_points(&args.event, args.cost, as_of)?)
            }
            PointsCommand::Balance => print_json(&user.balance()?),
            PointsCommand::History(args) => {
                let transactions = user.transactions(args.limit)?;
                if args.json {
                    print_json(&transactions)
                } else {
                    print_transactions_table(&transactions)
                }
            }
        },
        Command::Unlock { command } => match *command {
            UnlockCommand::Add(args) => {
                let content = ContentRef::parse(&args.content)?;
                print_json(&user.unlock(&content, as_of)?)
            }
            UnlockCommand::Check(args) => {
                let content = ContentRef::parse(&args.content)?;
                let unlocked = user.is_unlocked(&content)?;
                print_json(&json!({
                    "content": content,
                    "unlocked": unlocked,
                }))
            }
            UnlockCommand::List(args) => print_json(&user.recent_unlocks(args.limit)?),
        },
        Command::Activity { command } => match *command {
            ActivityCommand::Record(args) => {
                print_json(&user.record_activity(&args.activity_type, args.points, as_of)?)
            }
            ActivityCommand::Complete(args) => {
                let activity_type = match args.kind {
                    ActivityKindArg::Practice => ACTIVITY_PRACTICE,
                    ActivityKindArg::Spread => ACTIVITY_SPREAD,
                    ActivityKindArg::Quiz => ACTIVITY_QUIZ,
                };
                let completion =
                    user.complete_activity(activity_type, &args.event, args.points, as_of)?;
                print_json(&completion)
            }
            ActivityCommand::Metered(args) => {
                print_json(&user.record_metered_earning(&args.feature, &ctx)?)
            }
            ActivityCommand::Streak => {
                let streak_days = user.streak_days(as_of)?;
                print_json(&json!({ "streak_days": streak_days }))
            }
            ActivityCommand::Last7(args) => {
                let days = user.last_7_days(as_of)?;
                if args.json {
                    print_json(&days)
                } else {
                    print_daily_table(&days);
                    Ok(())
                }
            }
            ActivityCommand::Today => print_json(&user.today_progress(as_of)?),
        },
        Command::Journey { command } => match *command {
            JourneyCommand::Level => print_json(&user.level_info()?),
            JourneyCommand::Milestones(args) => {
                let milestones = user.milestones()?;
                if args.json {
                    print_json(&milestones)
                } else {
                    print_milestone_table(&milestones);
                    Ok(())
                }
            }
            JourneyCommand::Summary => print_json(&user.journey_summary(as_of)?),
        },
        Command::Policy { .. } => Err(anyhow!("policy commands are handled before engine setup")),
    }
}

fn run_policy(command: PolicyCommand, store: &SqliteEntitlementStore) -> Result<()> {
    match command {
        PolicyCommand::Show(args) => {
            let policy = match args.version {
                Some(version) => store
                    .policies()?
                    .remove(&version)
                    .ok_or_else(|| anyhow!("policy_version {version} not found"))?,
                None => store.latest_policy()?,
            };
            print_json(&policy)
        }
        PolicyCommand::Load(args) => {
            let raw = std::fs::read_to_string(&args.file)
                .with_context(|| format!("failed to read policy file {}", args.file.display()))?;
            let value: serde_json::Value = serde_json::from_str(&raw)
                .with_context(|| format!("invalid JSON in {}", args.file.display()))?;
            let policy = EntitlementPolicy::from_json(&value)?;
            store.upsert_policy(&policy)?;
            print_json(&json!({ "loaded_policy_version": policy.policy_version }))
        }
    }
}

impl SessionArgs {
    fn user_id(&self) -> Result<UserId> {
        let raw = self
            .user
            .as_deref()
            .ok_or_else(|| anyhow!("--user is required for this command"))?;
        Ok(UserId::parse(raw)?)
    }
}

fn parse_optional_utc(raw: Option<&str>) -> Result<OffsetDateTime> {
    match raw {
        Some(value) => parse_rfc3339_utc(value).map_err(|err| anyhow!("invalid timestamp: {err}")),
        None => Ok(now_utc()),
    }
}

fn print_json<T: serde::Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn yes_no(value: bool) -> &'static str {
    if value {
        "yes"
    } else {
        "no"
    }
}

fn print_decision_table(decision: &AccessDecision) {
    println!("feature: {} ({})", decision.feature.as_str(), decision.content);
    println!(
        "class={} allowed={} outcome={} premium_only={}",
        decision.policy_class,
        yes_no(decision.allowed),
        decision.outcome.as_str(),
        yes_no(decision.is_premium_only)
    );
    let optional = |value: Option<u32>| value.map_or_else(|| "-".to_string(), |v| v.to_string());
    println!(
        "cost={} affordable={} remaining_free={} earnings_remaining={}",
        optional(decision.cost),
        decision.affordable.map_or("-", yes_no),
        optional(decision.remaining_free),
        optional(decision.earnings_remaining)
    );
    if let Some(reason) = &decision.reason {
        println!("reason: {reason}");
    }
    println!("reasons={}", decision.reason_codes.join(","));
}

fn print_transactions_table(transactions: &[Transaction]) -> Result<()> {
    println!("{:<6} {:<26} {:<8} {:<21} event", "seq", "transaction_id", "delta", "occurred_at");
    println!("{}", "-".repeat(90));

    for tx in transactions {
        println!(
            "{:<6} {:<26} {:<8} {:<21} {}",
            tx.seq,
            tx.transaction_id,
            tx.delta,
            format_rfc3339(tx.occurred_at)?,
            tx.event
        );
    }
    Ok(())
}

fn print_daily_table(days: &[DailyPoints]) {
    println!("{:<12} points", "date");
    println!("{}", "-".repeat(24));

    for day in days {
        println!("{:<12} {}", format_date(day.date), day.total_points);
    }
}

fn print_milestone_table(milestones: &[Milestone]) {
    println!(
        "{:<14} {:<6} {:<9} {:<10} label",
        "id", "level", "required", "completed"
    );
    println!("{}", "-".repeat(72));

    for milestone in milestones {
        println!(
            "{:<14} {:<6} {:<9} {:<10} {}",
            milestone.id,
            milestone.level,
            milestone.required_points,
            yes_no(milestone.completed),
            milestone.label
        );
    }
}
