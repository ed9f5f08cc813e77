pub(crate) use pay_sentinel_domain::storage::StorageError;
