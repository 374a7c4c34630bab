use near_sdk::{PanicOnDefault, log, near};

#[near(contract_state)]
#[derive(PanicOnDefault)]
pub struct Contract {
    count: i64,
}

#[near]
impl Contract {
    #[init]
    pub fn new(starting_count: Option<i64>) -> Self {
        Self {
            count: starting_count.unwrap_or_default(),
        }
    }

    pub fn increment(&mut self) -> i64 {
        self.count += 1;
        log!("Increased number to {}", self.count);
        self.count
    }

    pub fn decrement(&mut self) -> i64 {
        self.count -= 1;
        log!("Decreased number to {}", self.count);
        self.count
    }

    // Sets the count to `value`, zero when omitted
    pub fn reset(&mut self, value: Option<i64>) -> i64 {
        self.count = value.unwrap_or_default();
        self.count
    }

    pub fn get_count(&self) -> i64 {
        self.count
    }
}
