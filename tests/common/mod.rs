//! Shared bank-account domain for integration tests.

#![allow(dead_code)]

use std::sync::Arc;

use eventfold_bus::{
    Aggregate, AggregateModel, AggregateRepository, Applies, Command, ConstraintViolation, HandlerContext,
    HandlerError, Handles, InMemorySignalStore, InMemoryStorage, Message, Signal, SignalBus, SignalBusBuilder,
    SignalContext,
};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Account {
    pub owner: String,
    pub balance: i64,
    pub open: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenAccount {
    pub id: String,
    pub owner: String,
}

impl Message for OpenAccount {
    const TYPE_NAME: &'static str = "bank.OpenAccount";

    fn validate(&self) -> Vec<ConstraintViolation> {
        if self.owner.trim().is_empty() {
            vec![ConstraintViolation::new("owner", "must not be blank")]
        } else {
            Vec::new()
        }
    }
}

impl Command for OpenAccount {
    fn target_id(&self) -> String {
        self.id.clone()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Deposit {
    pub id: String,
    pub amount: i64,
}

impl Message for Deposit {
    const TYPE_NAME: &'static str = "bank.Deposit";

    fn validate(&self) -> Vec<ConstraintViolation> {
        if self.amount <= 0 {
            vec![ConstraintViolation::new("amount", "must be positive")]
        } else {
            Vec::new()
        }
    }
}

impl Command for Deposit {
    fn target_id(&self) -> String {
        self.id.clone()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Withdraw {
    pub id: String,
    pub amount: i64,
}

impl Message for Withdraw {
    const TYPE_NAME: &'static str = "bank.Withdraw";
}

impl Command for Withdraw {
    fn target_id(&self) -> String {
        self.id.clone()
    }
}

/// Produces one `Deposited` per amount.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DepositMany {
    pub id: String,
    pub amounts: Vec<i64>,
}

impl Message for DepositMany {
    const TYPE_NAME: &'static str = "bank.DepositMany";
}

impl Command for DepositMany {
    fn target_id(&self) -> String {
        self.id.clone()
    }
}

/// Produces a state-neutral event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Audit {
    pub id: String,
}

impl Message for Audit {
    const TYPE_NAME: &'static str = "bank.Audit";
}

impl Command for Audit {
    fn target_id(&self) -> String {
        self.id.clone()
    }
}

/// Always fails with a technical error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Freeze {
    pub id: String,
}

impl Message for Freeze {
    const TYPE_NAME: &'static str = "bank.Freeze";
}

impl Command for Freeze {
    fn target_id(&self) -> String {
        self.id.clone()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountOpened {
    pub owner: String,
}

impl Message for AccountOpened {
    const TYPE_NAME: &'static str = "bank.AccountOpened";
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Deposited {
    pub amount: i64,
}

impl Message for Deposited {
    const TYPE_NAME: &'static str = "bank.Deposited";
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Withdrawn {
    pub amount: i64,
}

impl Message for Withdrawn {
    const TYPE_NAME: &'static str = "bank.Withdrawn";
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountAudited;

impl Message for AccountAudited {
    const TYPE_NAME: &'static str = "bank.AccountAudited";
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[error("account {id} holds {balance}, cannot withdraw {requested}")]
pub struct InsufficientFunds {
    pub id: String,
    pub balance: i64,
    pub requested: i64,
}

impl Message for InsufficientFunds {
    const TYPE_NAME: &'static str = "bank.InsufficientFunds";
}

impl Handles<OpenAccount> for Account {
    type Output = AccountOpened;

    fn handle(&self, cmd: OpenAccount, ctx: &HandlerContext<'_>) -> Result<AccountOpened, HandlerError> {
        if self.open {
            return Err(HandlerError::reject(ctx.expected_default(&self.owner, &cmd.owner)));
        }
        Ok(AccountOpened { owner: cmd.owner })
    }
}

impl Handles<Deposit> for Account {
    type Output = Deposited;

    fn handle(&self, cmd: Deposit, _: &HandlerContext<'_>) -> Result<Deposited, HandlerError> {
        Ok(Deposited { amount: cmd.amount })
    }
}

impl Handles<DepositMany> for Account {
    type Output = Vec<Deposited>;

    fn handle(&self, cmd: DepositMany, _: &HandlerContext<'_>) -> Result<Vec<Deposited>, HandlerError> {
        Ok(cmd.amounts.into_iter().map(|amount| Deposited { amount }).collect())
    }
}

impl Handles<Withdraw> for Account {
    type Output = Withdrawn;

    fn handle(&self, cmd: Withdraw, ctx: &HandlerContext<'_>) -> Result<Withdrawn, HandlerError> {
        if cmd.amount > self.balance {
            return Err(HandlerError::reject(InsufficientFunds {
                id: ctx.aggregate_id().to_string(),
                balance: self.balance,
                requested: cmd.amount,
            }));
        }
        Ok(Withdrawn { amount: cmd.amount })
    }
}

impl Handles<Audit> for Account {
    type Output = AccountAudited;

    fn handle(&self, _: Audit, _: &HandlerContext<'_>) -> Result<AccountAudited, HandlerError> {
        Ok(AccountAudited)
    }
}

impl Handles<Freeze> for Account {
    type Output = ();

    fn handle(&self, _: Freeze, _: &HandlerContext<'_>) -> Result<(), HandlerError> {
        Err(HandlerError::failed(std::io::Error::other("ledger unavailable")))
    }
}

impl Applies<AccountOpened> for Account {
    fn apply(mut self, event: &AccountOpened) -> Self {
        self.owner = event.owner.clone();
        self.open = true;
        self
    }
}

impl Applies<Deposited> for Account {
    fn apply(mut self, event: &Deposited) -> Self {
        self.balance += event.amount;
        self
    }
}

impl Applies<Withdrawn> for Account {
    fn apply(mut self, event: &Withdrawn) -> Self {
        self.balance -= event.amount;
        self
    }
}

impl Aggregate for Account {
    const AGGREGATE_TYPE: &'static str = "account";

    fn model() -> AggregateModel<Self> {
        AggregateModel::new()
            .handles::<OpenAccount>()
            .handles::<Deposit>()
            .handles::<DepositMany>()
            .handles::<Withdraw>()
            .handles::<Audit>()
            .handles::<Freeze>()
            .applies::<AccountOpened>()
            .applies::<Deposited>()
            .applies::<Withdrawn>()
            .neutral::<AccountAudited>()
    }
}

/// Wrap a command with a default context.
pub fn cmd<C: Command>(command: C) -> Signal {
    Signal::command(&command, SignalContext::default()).expect("command should encode")
}

pub fn open(id: &str, owner: &str) -> Signal {
    cmd(OpenAccount {
        id: id.into(),
        owner: owner.into(),
    })
}

pub fn deposit(id: &str, amount: i64) -> Signal {
    cmd(Deposit { id: id.into(), amount })
}

pub fn withdraw(id: &str, amount: i64) -> Signal {
    cmd(Withdraw { id: id.into(), amount })
}

/// A bus with an account repository and in-memory stores.
pub struct Bank {
    pub bus: SignalBus,
    pub signals: Arc<InMemorySignalStore>,
    pub storage: Arc<InMemoryStorage<eventfold_bus::Snapshot<Account>>>,
    pub accounts: Arc<AggregateRepository<Account>>,
}

impl Bank {
    pub fn new() -> Self {
        Self::with(|b| b)
    }

    pub fn with(configure: impl FnOnce(SignalBusBuilder) -> SignalBusBuilder) -> Self {
        let signals = Arc::new(InMemorySignalStore::new());
        let storage = Arc::new(InMemoryStorage::new());
        let accounts = Arc::new(AggregateRepository::<Account>::builder(Arc::clone(&storage)).build());
        let builder = SignalBus::builder()
            .signal_store(Arc::clone(&signals))
            .dispatcher(Arc::clone(&accounts));
        let bus = configure(builder).build().expect("bus should build");
        Self {
            bus,
            signals,
            storage,
            accounts,
        }
    }
}
