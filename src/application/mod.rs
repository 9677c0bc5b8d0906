pub mod auction_service;
