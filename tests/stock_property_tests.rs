//! Property-based tests for the stock store and the posting engine
//!
//! Random sequences of movements are applied both to the database and to a
//! plain in-memory model. Quantities must agree after every step and can
//! never go below zero, whatever the order of imports, exports and
//! transfers.

use std::collections::HashMap;

use proptest::prelude::*;
use stockpost::{
    Document, DocumentLine, DocumentStatus, PostingEngine, PostingError, Storage,
    repository::DocumentRepository,
    stock::{DeltaBatch, StockStore},
    types::{ProductId, WarehouseId},
};

const WAREHOUSES: [&str; 3] = ["wh_a", "wh_b", "wh_c"];
const PRODUCTS: [&str; 2] = ["prod_x", "prod_y"];

#[derive(Debug, Clone)]
enum Movement {
    Import { to: usize, product: usize, qty: u64 },
    Export { from: usize, product: usize, qty: u64 },
    Transfer { from: usize, to: usize, product: usize, qty: u64 },
}

// PROPERTY TEST STRATEGIES

/// Strategy to generate a single movement over the fixed catalog
fn movement_strategy() -> impl Strategy<Value = Movement> {
    prop_oneof![
        (0..WAREHOUSES.len(), 0..PRODUCTS.len(), 1u64..=20)
            .prop_map(|(to, product, qty)| Movement::Import { to, product, qty }),
        (0..WAREHOUSES.len(), 0..PRODUCTS.len(), 1u64..=20)
            .prop_map(|(from, product, qty)| Movement::Export { from, product, qty }),
        (0..WAREHOUSES.len(), 1..WAREHOUSES.len(), 0..PRODUCTS.len(), 1u64..=20).prop_map(
            |(from, offset, product, qty)| Movement::Transfer {
                from,
                to: (from + offset) % WAREHOUSES.len(),
                product,
                qty,
            }
        ),
    ]
}

/// Strategy to generate a batch of signed deltas
fn batch_strategy() -> impl Strategy<Value = Vec<(usize, usize, i64)>> {
    prop::collection::vec(
        (0..WAREHOUSES.len(), 0..PRODUCTS.len(), -15i64..=15),
        1..6,
    )
}

struct Harness {
    engine: PostingEngine,
    repo: DocumentRepository,
    stock: StockStore,
    warehouses: Vec<WarehouseId>,
    products: Vec<ProductId>,
}

fn harness() -> Harness {
    let storage = Storage::temporary().unwrap();
    let catalog = stockpost::catalog::Catalog::new(storage.clone());
    let warehouses = WAREHOUSES
        .iter()
        .map(|name| catalog.add_warehouse(name).unwrap().id)
        .collect();
    let products = PRODUCTS
        .iter()
        .map(|name| catalog.add_product(name, 10).unwrap().id)
        .collect();

    Harness {
        engine: PostingEngine::new(storage.clone()),
        repo: DocumentRepository::new(storage.clone()),
        stock: StockStore::new(storage),
        warehouses,
        products,
    }
}

impl Harness {
    fn document(&self, movement: &Movement) -> Document {
        match *movement {
            Movement::Import { to, product, qty } => {
                Document::import(self.warehouses[to].clone(), "prop")
                    .unwrap()
                    .line(DocumentLine::priced(self.products[product].clone(), qty, 10))
            }
            Movement::Export { from, product, qty } => {
                Document::export(self.warehouses[from].clone(), "prop")
                    .unwrap()
                    .line(DocumentLine::new(self.products[product].clone(), qty))
            }
            Movement::Transfer {
                from,
                to,
                product,
                qty,
            } => Document::transfer(
                self.warehouses[from].clone(),
                self.warehouses[to].clone(),
                "prop",
            )
            .unwrap()
            .line(DocumentLine::new(self.products[product].clone(), qty)),
        }
    }
}

/// Applies `movement` to the model, returning false if it would go negative
fn apply_to_model(model: &mut HashMap<(usize, usize), u64>, movement: &Movement) -> bool {
    let (out, into, product, qty) = match *movement {
        Movement::Import { to, product, qty } => (None, Some(to), product, qty),
        Movement::Export { from, product, qty } => (Some(from), None, product, qty),
        Movement::Transfer {
            from,
            to,
            product,
            qty,
        } => (Some(from), Some(to), product, qty),
    };

    if let Some(from) = out {
        let have = model.get(&(from, product)).copied().unwrap_or(0);
        if have < qty {
            return false;
        }
        model.insert((from, product), have - qty);
    }
    if let Some(to) = into {
        *model.entry((to, product)).or_insert(0) += qty;
    }
    true
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    /// Test that posting random movements keeps the database equal to the
    /// model and never drives a quantity negative
    #[test]
    fn postings_match_model(movements in prop::collection::vec(movement_strategy(), 1..25)) {
        let h = harness();
        let mut model = HashMap::new();

        for movement in &movements {
            let doc = h.document(movement);
            h.repo.insert(&doc).unwrap();

            let expected_ok = apply_to_model(&mut model, movement);
            let result = h.engine.post(&doc.id, "approver");

            prop_assert_eq!(result.is_ok(), expected_ok);
            if !expected_ok {
                let is_short = matches!(result, Err(PostingError::InsufficientStock(_)));
                prop_assert!(is_short);
            }

            let status = h.repo.load(&doc.id).unwrap().status;
            let expected_status = if expected_ok { DocumentStatus::Posted } else { DocumentStatus::Failed };
            prop_assert_eq!(status, expected_status);
        }

        for (w, warehouse) in h.warehouses.iter().enumerate() {
            for (p, product) in h.products.iter().enumerate() {
                let expected = model.get(&(w, p)).copied().unwrap_or(0);
                prop_assert_eq!(h.stock.quantity(warehouse, product).unwrap(), expected);
            }
        }
    }

    /// Test that a batch either applies every summed delta or leaves all
    /// quantities untouched
    #[test]
    fn batches_are_all_or_nothing(
        seed in prop::collection::vec((0..WAREHOUSES.len(), 0..PRODUCTS.len(), 0u64..=10), 0..6),
        deltas in batch_strategy(),
    ) {
        let h = harness();
        for (w, p, qty) in &seed {
            if *qty > 0 {
                h.stock.apply_delta(&h.warehouses[*w], &h.products[*p], *qty as i64).unwrap();
            }
        }

        let before: Vec<u64> = h.warehouses.iter()
            .flat_map(|w| h.products.iter().map(move |p| (w, p)))
            .map(|(w, p)| h.stock.quantity(w, p).unwrap())
            .collect();

        let mut batch = DeltaBatch::new();
        for (w, p, delta) in &deltas {
            batch.push(h.warehouses[*w].clone(), h.products[*p].clone(), i128::from(*delta));
        }
        let mut summed: HashMap<(usize, usize), i64> = HashMap::new();
        for (w, p, delta) in &deltas {
            *summed.entry((*w, *p)).or_insert(0) += delta;
        }
        let feasible = summed.iter().all(|((w, p), delta)| {
            before[w * PRODUCTS.len() + p] as i64 + delta >= 0
        });

        let result = h.stock.apply_delta_batch(&batch);
        prop_assert_eq!(result.is_ok(), feasible);

        for (w, warehouse) in h.warehouses.iter().enumerate() {
            for (p, product) in h.products.iter().enumerate() {
                let now = h.stock.quantity(warehouse, product).unwrap();
                let was = before[w * PRODUCTS.len() + p];
                let expected = if feasible {
                    (was as i64 + summed.get(&(w, p)).copied().unwrap_or(0)) as u64
                } else {
                    was
                };
                prop_assert_eq!(now, expected);
            }
        }
    }
}
