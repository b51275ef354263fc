mod renders;
