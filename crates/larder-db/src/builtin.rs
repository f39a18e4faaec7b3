//! The food-delivery sample schema and seed data.
//!
//! Every statement is written to converge when re-run on its own
//! (`IF NOT EXISTS`, `ON CONFLICT DO NOTHING`), and sticks to SQL that both
//! PostgreSQL and SQLite accept.

use larder_common::MigrationDefinition;

pub const SCHEMA_ID: &str = "2024-01-01_schema";
pub const SEED_ID: &str = "2024-01-02_seed";

/// Tables created by the schema migration, parents before children.
pub const TABLES: &[&str] = &[
    "restaurants",
    "menu_items",
    "customers",
    "couriers",
    "orders",
    "order_items",
];

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS restaurants (
        id BIGINT PRIMARY KEY,
        name TEXT NOT NULL,
        cuisine TEXT NOT NULL,
        address TEXT NOT NULL,
        rating NUMERIC(2, 1) CHECK (rating BETWEEN 0 AND 5),
        is_open BOOLEAN NOT NULL DEFAULT TRUE,
        created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
    )",
    "CREATE TABLE IF NOT EXISTS menu_items (
        id BIGINT PRIMARY KEY,
        restaurant_id BIGINT NOT NULL REFERENCES restaurants (id) ON DELETE CASCADE,
        name TEXT NOT NULL,
        description TEXT,
        price_cents INTEGER NOT NULL CHECK (price_cents >= 0),
        is_available BOOLEAN NOT NULL DEFAULT TRUE,
        UNIQUE (restaurant_id, name)
    )",
    "CREATE TABLE IF NOT EXISTS customers (
        id BIGINT PRIMARY KEY,
        name TEXT NOT NULL,
        email TEXT NOT NULL UNIQUE,
        phone TEXT,
        address TEXT NOT NULL,
        created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
    )",
    "CREATE TABLE IF NOT EXISTS couriers (
        id BIGINT PRIMARY KEY,
        name TEXT NOT NULL,
        phone TEXT NOT NULL,
        vehicle TEXT NOT NULL CHECK (vehicle IN ('bike', 'scooter', 'car')),
        is_active BOOLEAN NOT NULL DEFAULT TRUE
    )",
    "CREATE TABLE IF NOT EXISTS orders (
        id BIGINT PRIMARY KEY,
        customer_id BIGINT NOT NULL REFERENCES customers (id),
        restaurant_id BIGINT NOT NULL REFERENCES restaurants (id),
        courier_id BIGINT REFERENCES couriers (id),
        status TEXT NOT NULL DEFAULT 'placed'
            CHECK (status IN ('placed', 'preparing', 'picked_up', 'delivered', 'cancelled')),
        total_cents INTEGER NOT NULL CHECK (total_cents >= 0),
        placed_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
        delivered_at TIMESTAMP
    )",
    "CREATE TABLE IF NOT EXISTS order_items (
        order_id BIGINT NOT NULL REFERENCES orders (id) ON DELETE CASCADE,
        menu_item_id BIGINT NOT NULL REFERENCES menu_items (id),
        quantity INTEGER NOT NULL CHECK (quantity > 0),
        unit_price_cents INTEGER NOT NULL CHECK (unit_price_cents >= 0),
        PRIMARY KEY (order_id, menu_item_id)
    )",
    "CREATE INDEX IF NOT EXISTS idx_menu_items_restaurant ON menu_items (restaurant_id)",
    "CREATE INDEX IF NOT EXISTS idx_orders_customer ON orders (customer_id)",
    "CREATE INDEX IF NOT EXISTS idx_orders_status ON orders (status)",
];

const SEED: &[&str] = &[
    "INSERT INTO restaurants (id, name, cuisine, address, rating) VALUES
        (1, 'Pasta Palace', 'italian', '12 Harbour St', 4.6),
        (2, 'Dragon Wok', 'chinese', '88 Market Rd', 4.2),
        (3, 'Taco Town', 'mexican', '5 Plaza Ave', 4.4)
    ON CONFLICT (id) DO NOTHING",
    "INSERT INTO menu_items (id, restaurant_id, name, description, price_cents) VALUES
        (1, 1, 'Spaghetti Carbonara', 'Egg, pecorino, guanciale', 1450),
        (2, 1, 'Margherita Pizza', 'Tomato, mozzarella, basil', 1200),
        (3, 2, 'Kung Pao Chicken', 'Peanuts, chili, scallion', 1350),
        (4, 2, 'Vegetable Spring Rolls', NULL, 650),
        (5, 3, 'Carnitas Taco', 'Slow-cooked pork, salsa verde', 450),
        (6, 3, 'Chips and Guacamole', NULL, 700)
    ON CONFLICT (id) DO NOTHING",
    "INSERT INTO customers (id, name, email, phone, address) VALUES
        (1, 'Ada Lovelace', 'ada@example.com', '555-0101', '1 Analytical Way'),
        (2, 'Alan Turing', 'alan@example.com', NULL, '2 Enigma Close')
    ON CONFLICT (id) DO NOTHING",
    "INSERT INTO couriers (id, name, phone, vehicle) VALUES
        (1, 'Sam Rivera', '555-0201', 'bike'),
        (2, 'Kim Lee', '555-0202', 'scooter')
    ON CONFLICT (id) DO NOTHING",
    "INSERT INTO orders (id, customer_id, restaurant_id, courier_id, status, total_cents) VALUES
        (1, 1, 1, 1, 'delivered', 2650),
        (2, 2, 3, NULL, 'placed', 1600)
    ON CONFLICT (id) DO NOTHING",
    "INSERT INTO order_items (order_id, menu_item_id, quantity, unit_price_cents) VALUES
        (1, 1, 1, 1450),
        (1, 2, 1, 1200),
        (2, 5, 2, 450),
        (2, 6, 1, 700)
    ON CONFLICT (order_id, menu_item_id) DO NOTHING",
];

/// Schema first, then seed rows.
pub fn food_delivery() -> Vec<MigrationDefinition> {
    vec![
        MigrationDefinition::new(SCHEMA_ID, SCHEMA.iter().copied()),
        MigrationDefinition::new(SEED_ID, SEED.iter().copied()),
    ]
}
