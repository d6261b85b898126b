pub(crate) mod db_restore; // psql invocation against the live database
