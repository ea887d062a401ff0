use std::cmp::Ordering;

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::RwLock;
use tracing::{debug, info};
use uuid::Uuid;

use super::{validate_registration, AuctionStore, BID_BELOW_RESERVE, BID_NOT_ABOVE_TOP, USERNAME_TAKEN};
use crate::protocol::{
    AuctionStatus, Bid, BidInfo, Direction, ItemInfo, Keyword, NewItem, Price, RegisterUser,
    SearchOptions, SortBy, UserInfo,
};
use crate::{AppError, AppResult};

#[derive(Debug)]
struct StoredUser {
    info: UserInfo,
    password: String,
}

/// In-memory [`AuctionStore`].
///
/// Users and items live in sharded maps, so operations on different items do
/// not contend. Everything that reads and then writes one item happens under
/// that item's entry lock.
#[derive(Debug, Default)]
pub struct MemoryStore {
    users: DashMap<Uuid, StoredUser>,
    usernames: DashMap<String, Uuid>,
    items: DashMap<Uuid, ItemInfo>,
    keywords: RwLock<Vec<Keyword>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        MemoryStore::default()
    }

    /// Adds a user without running the registration rules.
    pub fn seed_user(&self, username: &str, password: &str, first_name: &str, last_name: &str) -> UserInfo {
        let info = UserInfo {
            user_id: Uuid::new_v4(),
            username: username.to_string(),
            first_name: first_name.to_string(),
            last_name: last_name.to_string(),
        };
        self.usernames.insert(username.to_string(), info.user_id);
        self.users.insert(
            info.user_id,
            StoredUser {
                info: info.clone(),
                password: password.to_string(),
            },
        );
        info
    }

    /// Adds an item as is, including its bids and status.
    pub fn seed_item(&self, item: ItemInfo) {
        self.remember_keywords(&item.keywords);
        self.items.insert(item.item_id, item);
    }

    pub fn user_count(&self) -> usize {
        self.users.len()
    }

    fn remember_keywords(&self, keywords: &[String]) {
        let mut known = self.keywords.write();
        for keyword in keywords {
            if known.iter().any(|k| k.keyword.eq_ignore_ascii_case(keyword)) {
                continue;
            }
            let keyword_id = known.len() as i32 + 1;
            known.push(Keyword {
                keyword_id,
                keyword: keyword.clone(),
            });
        }
    }

    fn items_where(&self, keep: impl Fn(&ItemInfo) -> bool) -> Vec<ItemInfo> {
        self.items
            .iter()
            .filter(|item| keep(item.value()))
            .map(|item| item.value().clone())
            .collect()
    }
}

fn matches_text(item: &ItemInfo, text: &str) -> bool {
    if text.is_empty() {
        return true;
    }
    let text = text.to_lowercase();
    item.title.to_lowercase().contains(&text)
        || item.description.to_lowercase().contains(&text)
        || item.keywords.iter().any(|k| k.to_lowercase().contains(&text))
}

fn within(time: DateTime<Utc>, from: DateTime<Utc>, to: DateTime<Utc>) -> bool {
    from <= time && time <= to
}

fn compare(a: &ItemInfo, b: &ItemInfo, sort: SortBy) -> Ordering {
    match sort {
        SortBy::Bid => {
            let top = |item: &ItemInfo| item.top_bid().map(|bid| bid.price).unwrap_or(Price::ZERO);
            top(a).cmp(&top(b))
        }
        SortBy::NumBids => a.bid_count().cmp(&b.bid_count()),
        SortBy::Time => a.end_time.cmp(&b.end_time),
        SortBy::Reserve => a.reserve.cmp(&b.reserve),
    }
}

fn not_found(what: &str, id: Uuid) -> AppError {
    AppError::NotFound(format!("{} {}", what, id))
}

impl AuctionStore for MemoryStore {
    fn login(&self, username: &str, password: &str) -> AppResult<UserInfo> {
        let user_id = self
            .usernames
            .get(username)
            .map(|id| *id)
            .ok_or(AppError::InvalidCredentials)?;
        let user = self.users.get(&user_id).ok_or(AppError::InvalidCredentials)?;
        if user.password != password {
            return Err(AppError::InvalidCredentials);
        }
        Ok(user.info.clone())
    }

    fn register(&self, registration: &RegisterUser) -> AppResult<UserInfo> {
        validate_registration(registration)?;
        match self.usernames.entry(registration.username.clone()) {
            Entry::Occupied(_) => Err(AppError::ValidationFailed(USERNAME_TAKEN.to_string())),
            Entry::Vacant(entry) => {
                let info = UserInfo {
                    user_id: Uuid::new_v4(),
                    username: registration.username.clone(),
                    first_name: registration.first_name.clone(),
                    last_name: registration.last_name.clone(),
                };
                self.users.insert(
                    info.user_id,
                    StoredUser {
                        info: info.clone(),
                        password: registration.password.clone(),
                    },
                );
                entry.insert(info.user_id);
                info!("New user ({}) added", info.user_id);
                Ok(info)
            }
        }
    }

    fn fetch_user(&self, user_id: Uuid) -> AppResult<UserInfo> {
        self.users
            .get(&user_id)
            .map(|user| user.info.clone())
            .ok_or_else(|| not_found("user", user_id))
    }

    fn create_item(&self, seller_id: Uuid, item: &NewItem) -> AppResult<ItemInfo> {
        if !self.users.contains_key(&seller_id) {
            return Err(not_found("user", seller_id));
        }
        if item.title.trim().is_empty() {
            return Err(AppError::ValidationFailed("Title must not be empty.".to_string()));
        }
        if item.end_time <= item.start_time {
            return Err(AppError::ValidationFailed(
                "Auction must end after it starts.".to_string(),
            ));
        }
        if item.reserve < Price::ZERO {
            return Err(AppError::ValidationFailed(
                "Reserve price must not be negative.".to_string(),
            ));
        }

        let info = ItemInfo {
            item_id: Uuid::new_v4(),
            seller_id,
            title: item.title.clone(),
            description: item.description.clone(),
            keywords: item.keywords.clone(),
            start_time: item.start_time,
            end_time: item.end_time,
            reserve: item.reserve,
            status: AuctionStatus::NotStarted,
            bids: Vec::new(),
        };
        self.remember_keywords(&info.keywords);
        self.items.insert(info.item_id, info.clone());
        debug!("Item {} created by {}", info.item_id, seller_id);
        Ok(info)
    }

    fn place_bid(&self, user_id: Uuid, bid: &Bid) -> AppResult<ItemInfo> {
        let mut item = self
            .items
            .get_mut(&bid.item_id)
            .ok_or_else(|| not_found("item", bid.item_id))?;

        if bid.price < item.reserve {
            return Err(AppError::ValidationFailed(BID_BELOW_RESERVE.to_string()));
        }
        if let Some(top) = item.top_bid() {
            if bid.price <= top.price {
                return Err(AppError::ValidationFailed(BID_NOT_ABOVE_TOP.to_string()));
            }
        }
        if item.status != AuctionStatus::Started {
            return Err(AppError::ValidationFailed(
                "Cannot bid on this item, the auction is not running.".to_string(),
            ));
        }
        if item.seller_id == user_id {
            return Err(AppError::ValidationFailed(
                "Cannot bid on your own item.".to_string(),
            ));
        }

        item.bids.push(BidInfo {
            bid_id: Uuid::new_v4(),
            item_id: bid.item_id,
            user_id,
            price: bid.price,
            time: Utc::now(),
        });
        Ok(item.clone())
    }

    fn search(&self, options: &SearchOptions) -> AppResult<Vec<ItemInfo>> {
        let mut found = self.items_where(|item| {
            item.status == AuctionStatus::Started
                && matches_text(item, &options.text)
                && (within(item.start_time, options.start_time, options.end_time)
                    || within(item.end_time, options.start_time, options.end_time))
                && item.reserve >= options.min_reserve
                && (!options.no_bids || item.bids.is_empty())
        });
        found.sort_by(|a, b| {
            let ordering = compare(a, b, options.sort);
            match options.direction {
                Direction::Ascending => ordering,
                Direction::Descending => ordering.reverse(),
            }
        });
        debug!("Found {} results.", found.len());
        Ok(found)
    }

    fn fetch_item(&self, item_id: Uuid) -> AppResult<ItemInfo> {
        self.items
            .get(&item_id)
            .map(|item| item.clone())
            .ok_or_else(|| not_found("item", item_id))
    }

    fn fetch_user_bids(&self, user_id: Uuid) -> AppResult<Vec<ItemInfo>> {
        let mut found: Vec<(DateTime<Utc>, ItemInfo)> = self
            .items
            .iter()
            .filter_map(|item| {
                item.bids
                    .iter()
                    .filter(|bid| bid.user_id == user_id)
                    .map(|bid| bid.time)
                    .max()
                    .map(|last_bid| (last_bid, item.value().clone()))
            })
            .collect();
        found.sort_by(|a, b| b.0.cmp(&a.0));
        Ok(found.into_iter().map(|(_, item)| item).collect())
    }

    fn fetch_seller_list(&self, seller_id: Uuid) -> AppResult<Vec<ItemInfo>> {
        let mut found = self.items_where(|item| item.seller_id == seller_id);
        found.sort_by(|a, b| b.start_time.cmp(&a.start_time));
        Ok(found)
    }

    fn fetch_keywords(&self) -> AppResult<Vec<Keyword>> {
        Ok(self.keywords.read().clone())
    }

    fn fetch_reserve_range(&self) -> AppResult<Price> {
        Ok(self
            .items
            .iter()
            .map(|item| item.reserve)
            .max()
            .unwrap_or(Price::ZERO))
    }

    fn start_auction(&self, item_id: Uuid) -> AppResult<ItemInfo> {
        let mut item = self
            .items
            .get_mut(&item_id)
            .ok_or_else(|| not_found("item", item_id))?;
        match item.status {
            AuctionStatus::Ended => Err(AppError::OperationFailure(
                "Cannot start auction, auction has already ended.".to_string(),
            )),
            _ => {
                item.status = AuctionStatus::Started;
                Ok(item.clone())
            }
        }
    }

    fn end_auction(&self, item_id: Uuid) -> AppResult<ItemInfo> {
        let mut item = self
            .items
            .get_mut(&item_id)
            .ok_or_else(|| not_found("item", item_id))?;
        item.status = AuctionStatus::Ended;
        Ok(item.clone())
    }
}
