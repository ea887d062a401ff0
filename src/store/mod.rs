//! Data access shared by every task.
//!
//! Tasks only ever touch auction state through an [`AuctionStore`]; the store
//! is responsible for keeping each operation atomic.

pub use memory::MemoryStore;
pub use validation::{validate_name, validate_password, validate_registration, validate_username};

mod memory;
mod validation;

use uuid::Uuid;

use crate::protocol::{Bid, ItemInfo, Keyword, NewItem, Price, RegisterUser, SearchOptions, UserInfo};
use crate::AppResult;

pub const USERNAME_TAKEN: &str = "A user with that username already exists.";
pub const BID_BELOW_RESERVE: &str = "Bid must be greater than or equal to the reserve price.";
pub const BID_NOT_ABOVE_TOP: &str = "Bid is less than or equal to current top bid.";

pub trait AuctionStore: Send + Sync + 'static {
    /// [`crate::AppError::InvalidCredentials`] for an unknown user as well as
    /// a wrong password.
    fn login(&self, username: &str, password: &str) -> AppResult<UserInfo>;

    /// Validates and adds a user. Rule violations come back as
    /// [`crate::AppError::ValidationFailed`] carrying the message for the user.
    fn register(&self, registration: &RegisterUser) -> AppResult<UserInfo>;

    fn fetch_user(&self, user_id: Uuid) -> AppResult<UserInfo>;

    fn create_item(&self, seller_id: Uuid, item: &NewItem) -> AppResult<ItemInfo>;

    /// Records the bid and returns the updated item. Bids at or under the
    /// current top bid, under the reserve, on an auction that is not running
    /// or on one's own item are rejected with
    /// [`crate::AppError::ValidationFailed`].
    fn place_bid(&self, user_id: Uuid, bid: &Bid) -> AppResult<ItemInfo>;

    /// Running auctions matching `options`, in the requested order.
    fn search(&self, options: &SearchOptions) -> AppResult<Vec<ItemInfo>>;

    fn fetch_item(&self, item_id: Uuid) -> AppResult<ItemInfo>;

    /// Items `user_id` has bid on, most recent bid first.
    fn fetch_user_bids(&self, user_id: Uuid) -> AppResult<Vec<ItemInfo>>;

    fn fetch_seller_list(&self, seller_id: Uuid) -> AppResult<Vec<ItemInfo>>;

    fn fetch_keywords(&self) -> AppResult<Vec<Keyword>>;

    /// Highest reserve of any item, zero when there are none.
    fn fetch_reserve_range(&self) -> AppResult<Price>;

    fn start_auction(&self, item_id: Uuid) -> AppResult<ItemInfo>;

    fn end_auction(&self, item_id: Uuid) -> AppResult<ItemInfo>;
}
