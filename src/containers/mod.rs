pub mod perishable;
