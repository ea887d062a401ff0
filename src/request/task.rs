use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use crate::protocol::{
    Bid, NewItem, Packet, PacketType, Payload, RegisterUser, SearchOptions, UserInfo,
};
use crate::service::{BiddrConfig, ClientConnection, ClientRegistry};
use crate::store::AuctionStore;
use crate::utils::{PoolHandler, TaskQueue};
use crate::{AppError, AppResult};

pub const LOGIN_INVALID: &str = "Invalid username/password.";
pub const LOGIN_ERROR: &str = "A client/server error occurred during login.";
pub const REGISTER_ERROR: &str = "Server encountered an error processing that request.";
pub const CREATE_ITEM_ERROR: &str = "There was an error creating the auction for that item.";
pub const NOT_LOGGED_IN: &str = "You must be logged in to do that.";
pub const PLACE_BID_ERROR: &str = "There was an error placing that bid.";

/// Everything a task may touch besides its own input.
#[derive(Clone)]
pub struct TaskContext {
    pub store: Arc<dyn AuctionStore>,
    pub registry: Arc<ClientRegistry>,
    pub queue: TaskQueue<Task>,
    pub config: Arc<BiddrConfig>,
}

impl PoolHandler<Task> for TaskContext {
    fn handle(&self, task: Task) -> impl Future<Output = ()> + Send {
        let context = self.clone();
        async move { task.run(&context).await }
    }
}

/// A unit of work queued on the worker pool.
///
/// Client tasks answer the client they came from; auction lifecycle tasks
/// belong to the server itself.
#[derive(Debug)]
pub enum Task {
    Login {
        client: Arc<ClientConnection>,
        credentials: Vec<String>,
    },
    Logout {
        client: Arc<ClientConnection>,
    },
    Register {
        client: Arc<ClientConnection>,
        registration: RegisterUser,
    },
    CreateItem {
        client: Arc<ClientConnection>,
        item: NewItem,
    },
    PlaceBid {
        client: Arc<ClientConnection>,
        bid: Bid,
    },
    Search {
        client: Arc<ClientConnection>,
        options: SearchOptions,
    },
    FetchItem {
        client: Arc<ClientConnection>,
        item_id: Uuid,
    },
    FetchUser {
        client: Arc<ClientConnection>,
        user_id: Uuid,
    },
    FetchUserBids {
        client: Arc<ClientConnection>,
        user_id: Uuid,
    },
    FetchSellerList {
        client: Arc<ClientConnection>,
    },
    FetchKeywords {
        client: Arc<ClientConnection>,
    },
    FetchReserveRange {
        client: Arc<ClientConnection>,
    },
    PingPong {
        client: Arc<ClientConnection>,
    },
    AuctionStart {
        item_id: Uuid,
    },
    AuctionEnd {
        item_id: Uuid,
    },
}

impl Task {
    pub fn name(&self) -> &'static str {
        match self {
            Task::Login { .. } => "Login",
            Task::Logout { .. } => "Logout",
            Task::Register { .. } => "Register",
            Task::CreateItem { .. } => "CreateItem",
            Task::PlaceBid { .. } => "PlaceBid",
            Task::Search { .. } => "Search",
            Task::FetchItem { .. } => "FetchItem",
            Task::FetchUser { .. } => "FetchUser",
            Task::FetchUserBids { .. } => "FetchUserBids",
            Task::FetchSellerList { .. } => "FetchSellerList",
            Task::FetchKeywords { .. } => "FetchKeywords",
            Task::FetchReserveRange { .. } => "FetchReserveRange",
            Task::PingPong { .. } => "PingPong",
            Task::AuctionStart { .. } => "AuctionStart",
            Task::AuctionEnd { .. } => "AuctionEnd",
        }
    }

    /// Runs the task. Errors and panics never leave this function: they are
    /// logged and answered by [`Task::failure_action`], exactly once.
    pub async fn run(&self, ctx: &TaskContext) {
        trace!("Running task {}", self.name());
        let outcome = AssertUnwindSafe(self.run_safe(ctx)).catch_unwind().await;
        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                error!("An error occurred whilst executing {}: {}", self.name(), e);
                self.failure_action(Some(&e));
            }
            Err(panic) => {
                let message = panic
                    .downcast_ref::<&'static str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                error!("Task {} panicked: {}", self.name(), message);
                self.failure_action(None);
            }
        }
    }

    async fn run_safe(&self, ctx: &TaskContext) -> AppResult<()> {
        match self {
            Task::Login {
                client,
                credentials,
            } => login(ctx, client, credentials),
            Task::Logout { client } => {
                let Some(user) = client.user() else {
                    warn!(client_id = client.id(), "logout from a client that is not logged in");
                    return client.send_packet(Packet::logout());
                };
                client.set_user(None);
                info!("{} logged out on client #{}", user.username, client.id());
                Ok(())
            }
            Task::Register {
                client,
                registration,
            } => register(ctx, client, registration),
            Task::CreateItem { client, item } => create_item(ctx, client, item),
            Task::PlaceBid { client, bid } => place_bid(ctx, client, bid),
            Task::Search { client, options } => {
                let items = ctx.store.search(options)?;
                client.send_packet(Packet::with_payload(
                    PacketType::SearchResults,
                    Payload::Items(items),
                ))
            }
            Task::FetchItem { client, item_id } => {
                let item = ctx.store.fetch_item(*item_id)?;
                client.send_packet(Packet::with_payload(PacketType::Item, Payload::Item(item)))
            }
            Task::FetchUser { client, user_id } => {
                let user = ctx.store.fetch_user(*user_id)?;
                client.send_packet(Packet::with_payload(PacketType::User, Payload::User(user)))
            }
            Task::FetchUserBids { client, user_id } => {
                let items = ctx.store.fetch_user_bids(*user_id)?;
                client.send_packet(Packet::with_payload(
                    PacketType::UserBids,
                    Payload::Items(items),
                ))
            }
            Task::FetchSellerList { client } => {
                let seller = logged_in_user(client)?;
                let items = ctx.store.fetch_seller_list(seller.user_id)?;
                client.send_packet(Packet::with_payload(
                    PacketType::SellerList,
                    Payload::Items(items),
                ))
            }
            Task::FetchKeywords { client } => {
                let keywords = ctx.store.fetch_keywords()?;
                client.send_packet(Packet::with_payload(
                    PacketType::Keywords,
                    Payload::Keywords(keywords),
                ))
            }
            Task::FetchReserveRange { client } => {
                let max = ctx.store.fetch_reserve_range()?;
                client.send_packet(Packet::with_payload(
                    PacketType::ReserveRange,
                    Payload::Number(max.cents()),
                ))
            }
            Task::PingPong { client } => {
                if !client.is_connected() {
                    return Ok(());
                }
                client.send_packet(Packet::ping())
            }
            Task::AuctionStart { item_id } => {
                ctx.store.start_auction(*item_id)?;
                info!("Auction for Item({}) started!", item_id);
                ctx.registry.broadcast_packet(
                    &Packet::with_payload(PacketType::AuctionStart, Payload::Id(*item_id)),
                    false,
                );
                Ok(())
            }
            Task::AuctionEnd { item_id } => auction_end(ctx, *item_id),
        }
    }

    /// Tells the client its request failed. Server tasks only log.
    ///
    /// `cause` is `None` when the task panicked.
    fn failure_action(&self, cause: Option<&AppError>) {
        let reply = match self {
            Task::Login { client, .. } => Some((client, Packet::with_text(PacketType::LoginFail, LOGIN_ERROR))),
            Task::Logout { client } => Some((client, Packet::logout())),
            Task::Register { client, .. } => Some((
                client,
                Packet::with_text(PacketType::RegisterFail, REGISTER_ERROR),
            )),
            Task::CreateItem { client, .. } => Some((
                client,
                Packet::with_text(PacketType::CreateItemFail, CREATE_ITEM_ERROR),
            )),
            Task::PlaceBid { client, .. } => {
                let reason = match cause {
                    Some(AppError::OperationFailure(reason) | AppError::ValidationFailed(reason)) => {
                        reason.as_str()
                    }
                    _ => PLACE_BID_ERROR,
                };
                Some((client, Packet::with_text(PacketType::PlaceBidFail, reason)))
            }
            Task::Search { client, .. } => Some((
                client,
                Packet::with_payload(PacketType::SearchResults, Payload::Items(Vec::new())),
            )),
            Task::FetchItem { client, .. } => Some((client, Packet::new(PacketType::Item))),
            Task::FetchUser { client, .. } => Some((client, Packet::new(PacketType::User))),
            Task::FetchUserBids { client, .. } => Some((
                client,
                Packet::with_payload(PacketType::UserBids, Payload::Items(Vec::new())),
            )),
            Task::FetchSellerList { client } => Some((
                client,
                Packet::with_payload(PacketType::SellerList, Payload::Items(Vec::new())),
            )),
            Task::FetchKeywords { client } => Some((
                client,
                Packet::with_payload(PacketType::Keywords, Payload::Keywords(Vec::new())),
            )),
            Task::FetchReserveRange { client } => Some((
                client,
                Packet::with_payload(PacketType::ReserveRange, Payload::Number(0)),
            )),
            Task::PingPong { .. } => None,
            Task::AuctionStart { item_id } => {
                error!("Failed to start auction for Item({})", item_id);
                None
            }
            Task::AuctionEnd { item_id } => {
                error!("Failed to end auction for Item({})", item_id);
                None
            }
        };

        if let Some((client, packet)) = reply {
            if let Err(e) = client.send_packet(packet) {
                warn!(client_id = client.id(), "could not report {} failure: {}", self.name(), e);
            }
        }
    }
}

fn logged_in_user(client: &ClientConnection) -> AppResult<UserInfo> {
    client
        .user()
        .ok_or_else(|| AppError::OperationFailure(NOT_LOGGED_IN.to_string()))
}

fn until(time: DateTime<Utc>) -> Duration {
    (time - Utc::now()).to_std().unwrap_or(Duration::ZERO)
}

fn login(ctx: &TaskContext, client: &ClientConnection, credentials: &[String]) -> AppResult<()> {
    let [username, password] = credentials else {
        return client.send_packet(Packet::with_text(PacketType::LoginFail, LOGIN_ERROR));
    };
    match ctx.store.login(username, password) {
        Ok(user) => {
            info!("{} ({}) logged in on client #{}", user.username, user.user_id, client.id());
            client.set_user(Some(user.clone()));
            client.send_packet(Packet::with_payload(PacketType::LoginSuccess, Payload::User(user)))
        }
        Err(e) => {
            warn!("User ({}) failed to login. {}", username, e);
            client.send_packet(Packet::with_text(PacketType::LoginFail, LOGIN_INVALID))
        }
    }
}

fn register(ctx: &TaskContext, client: &ClientConnection, registration: &RegisterUser) -> AppResult<()> {
    match ctx.store.register(registration) {
        Ok(user) => client.send_packet(Packet::with_payload(
            PacketType::RegisterSuccess,
            Payload::User(user),
        )),
        Err(AppError::ValidationFailed(reason)) => {
            debug!("registration of {} rejected: {}", registration.username, reason);
            client.send_packet(Packet::with_text(PacketType::RegisterFail, reason))
        }
        Err(e) => Err(e),
    }
}

fn create_item(ctx: &TaskContext, client: &ClientConnection, item: &NewItem) -> AppResult<()> {
    let Some(seller) = client.user() else {
        return client.send_packet(Packet::with_text(PacketType::CreateItemFail, NOT_LOGGED_IN));
    };
    let created = match ctx.store.create_item(seller.user_id, item) {
        Ok(created) => created,
        Err(AppError::ValidationFailed(reason)) => {
            return client.send_packet(Packet::with_text(PacketType::CreateItemFail, reason));
        }
        Err(e) => return Err(e),
    };
    info!("New item ({}) added by {}", created.item_id, seller.username);

    ctx.queue.schedule(
        Task::AuctionStart {
            item_id: created.item_id,
        },
        until(created.start_time),
    );
    ctx.queue.schedule(
        Task::AuctionEnd {
            item_id: created.item_id,
        },
        until(created.end_time),
    );
    client.send_packet(Packet::with_payload(
        PacketType::CreateItemSuccess,
        Payload::Id(created.item_id),
    ))
}

fn place_bid(ctx: &TaskContext, client: &ClientConnection, bid: &Bid) -> AppResult<()> {
    let Some(bidder) = client.user() else {
        return client.send_packet(Packet::with_text(PacketType::PlaceBidFail, NOT_LOGGED_IN));
    };
    let item = match ctx.store.place_bid(bidder.user_id, bid) {
        Ok(item) => item,
        Err(AppError::ValidationFailed(reason)) => {
            return client.send_packet(Packet::with_text(PacketType::PlaceBidFail, reason));
        }
        Err(AppError::NotFound(_)) => {
            return client.send_packet(Packet::with_text(
                PacketType::PlaceBidFail,
                "Cannot bid on this item.",
            ));
        }
        Err(e) => return Err(e),
    };
    debug!("{} bid {} on item {}", bidder.username, bid.price, bid.item_id);

    client.send_packet(Packet::new(PacketType::PlaceBidSuccess))?;
    ctx.registry
        .broadcast_packet(&Packet::with_payload(PacketType::Item, Payload::Item(item)), true);
    Ok(())
}

fn auction_end(ctx: &TaskContext, item_id: Uuid) -> AppResult<()> {
    let item = ctx.store.end_auction(item_id)?;
    info!("Auction for Item({}) ended", item_id);
    ctx.registry.broadcast_packet(
        &Packet::with_payload(PacketType::AuctionEnd, Payload::Id(item_id)),
        true,
    );

    let (user_id, packet_type) = match item.top_bid() {
        Some(winning) => (winning.user_id, PacketType::AuctionWin),
        None => (item.seller_id, PacketType::AuctionNoWinner),
    };
    for client in ctx.registry.find_user(user_id) {
        if let Err(e) = client.send_packet(Packet::with_payload(packet_type, Payload::Id(item_id))) {
            debug!(client_id = client.id(), "could not send {}: {}", packet_type, e);
        }
    }
    Ok(())
}
