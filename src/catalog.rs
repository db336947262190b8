//! Products and warehouses referenced by documents
use crate::error::{CatalogError, StoreError};
use crate::stock::StockStore;
use crate::storage::{Storage, TxResult, UnitOfWork, decode, decode_in, encode, encode_in, settle};
use crate::types::{Product, ProductId, Warehouse, WarehouseId};

const MAX_PRODUCT_NAME: usize = 100;
const MAX_LOCATION: usize = 200;

#[derive(Clone, Debug)]
pub struct Catalog {
    storage: Storage,
}

fn check_product_name(name: &str) -> Result<(), CatalogError> {
    if name.trim().is_empty() {
        return Err(CatalogError::Invalid("product name cannot be empty"));
    }
    if name.chars().count() > MAX_PRODUCT_NAME {
        return Err(CatalogError::Invalid(
            "product name cannot exceed 100 characters",
        ));
    }
    Ok(())
}

fn check_location(location: &str) -> Result<(), CatalogError> {
    if location.trim().is_empty() {
        return Err(CatalogError::Invalid("warehouse location cannot be empty"));
    }
    if location.chars().count() > MAX_LOCATION {
        return Err(CatalogError::Invalid(
            "warehouse location cannot exceed 200 characters",
        ));
    }
    Ok(())
}

impl Catalog {
    pub fn new(storage: Storage) -> Self {
        Self { storage }
    }

    pub fn add_product(&self, name: &str, unit_price: u64) -> Result<Product, CatalogError> {
        check_product_name(name)?;
        let product = Product {
            id: ProductId::generate().map_err(|e| StoreError::Id(e.to_string()))?,
            name: name.to_owned(),
            unit_price,
        };
        self.storage
            .products
            .insert(product.id.as_str(), encode(&product)?)
            .map_err(StoreError::from)?;

        tracing::debug!(product = %product.id, "product added");
        Ok(product)
    }

    pub fn product(&self, id: &ProductId) -> Result<Product, CatalogError> {
        match self.storage.products.get(id.as_str()).map_err(StoreError::from)? {
            Some(bytes) => Ok(decode(&bytes)?),
            None => Err(CatalogError::ProductNotFound(id.clone())),
        }
    }

    /// Name and price edits never touch past movements; posted documents
    /// carry their own line prices.
    pub fn update_product(
        &self,
        id: &ProductId,
        name: Option<&str>,
        unit_price: Option<u64>,
    ) -> Result<Product, CatalogError> {
        if let Some(name) = name {
            check_product_name(name)?;
        }
        settle(self.storage.unit_of_work(|uow| {
            let Some(mut product) = Self::product_in::<CatalogError>(uow, id)? else {
                return sled::transaction::abort(CatalogError::ProductNotFound(id.clone()));
            };
            if let Some(name) = name {
                product.name = name.to_owned();
            }
            if let Some(unit_price) = unit_price {
                product.unit_price = unit_price;
            }
            uow.products
                .insert(id.as_str(), encode_in::<_, CatalogError>(&product)?)?;
            Ok(product)
        }))
    }

    pub fn add_warehouse(&self, location: &str) -> Result<Warehouse, CatalogError> {
        check_location(location)?;
        let warehouse = Warehouse {
            id: WarehouseId::generate().map_err(|e| StoreError::Id(e.to_string()))?,
            location: location.to_owned(),
        };
        self.storage
            .warehouses
            .insert(warehouse.id.as_str(), encode(&warehouse)?)
            .map_err(StoreError::from)?;

        tracing::debug!(warehouse = %warehouse.id, "warehouse added");
        Ok(warehouse)
    }

    pub fn warehouse(&self, id: &WarehouseId) -> Result<Warehouse, CatalogError> {
        match self.storage.warehouses.get(id.as_str()).map_err(StoreError::from)? {
            Some(bytes) => Ok(decode(&bytes)?),
            None => Err(CatalogError::WarehouseNotFound(id.clone())),
        }
    }

    pub fn warehouses(&self) -> Result<Vec<Warehouse>, CatalogError> {
        let mut all = vec![];
        for entry in self.storage.warehouses.iter() {
            let (_, bytes) = entry.map_err(StoreError::from)?;
            all.push(decode(&bytes)?);
        }
        Ok(all)
    }

    pub fn relabel_warehouse(
        &self,
        id: &WarehouseId,
        location: &str,
    ) -> Result<Warehouse, CatalogError> {
        check_location(location)?;
        settle(self.storage.unit_of_work(|uow| {
            let Some(mut warehouse) = Self::warehouse_in::<CatalogError>(uow, id)? else {
                return sled::transaction::abort(CatalogError::WarehouseNotFound(id.clone()));
            };
            warehouse.location = location.to_owned();
            uow.warehouses
                .insert(id.as_str(), encode_in::<_, CatalogError>(&warehouse)?)?;
            Ok(warehouse)
        }))
    }

    /// Removes a warehouse that holds no stock.
    ///
    /// Occupancy is read in the same transaction as the delete, so a posting
    /// that stocks the warehouse concurrently either lands first and blocks
    /// the delete, or finds the warehouse gone.
    pub fn remove_warehouse(&self, id: &WarehouseId) -> Result<(), CatalogError> {
        settle(self.storage.unit_of_work(|uow| {
            if Self::warehouse_in::<CatalogError>(uow, id)?.is_none() {
                return sled::transaction::abort(CatalogError::WarehouseNotFound(id.clone()));
            }
            if StockStore::occupancy_in::<CatalogError>(uow, id)? > 0 {
                return sled::transaction::abort(CatalogError::WarehouseNotEmpty(id.clone()));
            }
            uow.warehouses.remove(id.as_str())?;
            Ok(())
        }))?;

        tracing::debug!(warehouse = %id, "warehouse removed");
        Ok(())
    }

    pub fn warehouse_in<E>(uow: &UnitOfWork<'_>, id: &WarehouseId) -> TxResult<Option<Warehouse>, E>
    where
        E: From<StoreError>,
    {
        match uow.warehouses.get(id.as_str())? {
            Some(bytes) => Ok(Some(decode_in::<_, E>(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn product_in<E>(uow: &UnitOfWork<'_>, id: &ProductId) -> TxResult<Option<Product>, E>
    where
        E: From<StoreError>,
    {
        match uow.products.get(id.as_str())? {
            Some(bytes) => Ok(Some(decode_in::<_, E>(&bytes)?)),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn catalog() -> Catalog {
        Catalog::new(Storage::temporary().unwrap())
    }

    #[test]
    fn product_names_are_validated() {
        let catalog = catalog();

        assert!(matches!(catalog.add_product(" ", 10), Err(CatalogError::Invalid(_))));
        assert!(matches!(
            catalog.add_product(&"x".repeat(101), 10),
            Err(CatalogError::Invalid(_))
        ));
        assert!(catalog.add_product("Widget", 0).is_ok());
    }

    #[test]
    fn product_edits_are_persisted() {
        let catalog = catalog();
        let product = catalog.add_product("Widget", 1_000).unwrap();

        let updated = catalog
            .update_product(&product.id, Some("Gadget"), None)
            .unwrap();
        assert_eq!(updated.name, "Gadget");
        assert_eq!(updated.unit_price, 1_000);
        assert_eq!(catalog.product(&product.id).unwrap(), updated);
    }

    #[test]
    fn unknown_entities_are_not_found() {
        let catalog = catalog();

        assert!(matches!(
            catalog.warehouse(&WarehouseId::from("wh_missing")),
            Err(CatalogError::WarehouseNotFound(_))
        ));
        assert!(matches!(
            catalog.remove_warehouse(&WarehouseId::from("wh_missing")),
            Err(CatalogError::WarehouseNotFound(_))
        ));
    }

    #[test]
    fn stocked_warehouse_cannot_be_removed() {
        let storage = Storage::temporary().unwrap();
        let catalog = Catalog::new(storage.clone());
        let stock = StockStore::new(storage);
        let warehouse = catalog.add_warehouse("Dock 4").unwrap();
        let product = ProductId::from("prod_a");

        stock.apply_delta(&warehouse.id, &product, 3).unwrap();
        assert!(matches!(
            catalog.remove_warehouse(&warehouse.id),
            Err(CatalogError::WarehouseNotEmpty(_))
        ));

        stock.apply_delta(&warehouse.id, &product, -3).unwrap();
        catalog.remove_warehouse(&warehouse.id).unwrap();
        assert!(catalog.warehouses().unwrap().is_empty());
    }
}
