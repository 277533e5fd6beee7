pub mod tenant_context;
